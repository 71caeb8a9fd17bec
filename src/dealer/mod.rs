//! The per-round protocol state machine.
//!
//! A dealer drives one validator through one key generation round. It
//! owns the fresh round keypair, the key generation instance, the
//! per-phase inboxes and an ordered queue of predicate-guarded
//! transitions. Inbound messages are stored by the phase handlers, each
//! of which then pumps [`transit`](DealerState::transit): the head
//! transition runs once its readiness predicate holds, emitting the next
//! phase's messages as a side effect. Progress is therefore monotonic and
//! driven purely by message arrivals; there are no timers anywhere.

use std::collections::VecDeque;
use std::sync::Arc;

use getset::CopyGetters;
use thiserror::Error;
use tracing::{debug, info};

use crate::config;
use crate::crypto::signature::{Signature, ValidatorAddress};
use crate::crypto::threshold::{
    BlsVerifier, ComplaintCommits, Deal, Justification, KeyGenerator, KeyGeneratorFactory, Point,
    ReconstructCommits, Response, Scalar, SecretCommits,
};
use crate::error::*;
use crate::events::{DkgEvent, EventHub};
use crate::messages::{Codec, DkgMessage, MessageKind};
use crate::ordering::RoundId;
use crate::validators::ValidatorSet;
use crate::Err;

mod onchain;
mod store;

pub use onchain::OnChainDealer;
pub use store::{MessageStore, PkStore};

/// Callback handed in by the round manager; it signs the messages and
/// fans them out through the active transport.
pub type SendMsgCb = Arc<dyn Fn(Vec<DkgMessage>) -> Result<()> + Send + Sync>;

#[derive(Error, Debug)]
pub enum DealerError {
    /// The round is still in flight. This is the normal "keep feeding me
    /// messages" signal, never a failure.
    #[error("verifier not ready yet")]
    VerifierNotReady,
    #[error("failed to decode {kind:?} payload from {from}: {reason}")]
    Decode {
        kind: MessageKind,
        from: ValidatorAddress,
        reason: String,
    },
    #[error("message signature does not verify against {from}")]
    SignatureInvalid { from: ValidatorAddress },
    #[error("sender {from} is not in the round's validator set")]
    UnknownSender { from: ValidatorAddress },
    #[error("dkg instance is not certified")]
    NotCertified,
    #[error("{missing} participants failed to complete phase one")]
    QualIncomplete { missing: usize },
    #[error("round ran to completion but the dkg instance is not finished")]
    InstanceNotFinished,
    #[error("dealer has no dkg instance yet")]
    NoInstance,
}

/// Why a validator ended up on the loser list.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoserKind {
    CorruptData,
    MissingData,
    DuplicateData,
    CorruptJustification,
}

/// A validator flagged for slashing in this round.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Loser {
    pub addr: ValidatorAddress,
    pub kind: LoserKind,
}

/// The predicate-guarded steps of the state machine, in queue order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transition {
    /// On-chain variant only: commitments go out before any deal.
    SendCommits,
    SendDeals,
    ProcessDeals,
    ProcessResponses,
    ProcessJustifications,
    ProcessCommits,
    ProcessComplaints,
    ProcessReconstructCommits,
}

/// Fault injection used by tests: faults suppress or corrupt emissions at
/// the points where a byzantine dealer could.
#[derive(Debug, Copy, Clone, Default)]
pub struct DealerFaults {
    /// Withhold the last deal.
    pub drop_one_deal: bool,
    /// Withhold every deal.
    pub drop_all_deals: bool,
    /// Withhold the phase-II commits.
    pub drop_commits: bool,
    /// Replace every deal payload with garbage bytes.
    pub corrupt_deals: bool,
}

/// The state shared by both dealer variants.
#[derive(CopyGetters)]
pub struct DealerState {
    validators: ValidatorSet,
    #[getset(get_copy = "pub")]
    addr: ValidatorAddress,
    /// Our index in the sorted roster; assigned once all public keys
    /// arrived and the key generation instance exists.
    #[getset(get_copy = "pub")]
    participant_id: Option<usize>,
    #[getset(get_copy = "pub")]
    round_id: RoundId,

    sec_key: Option<Scalar>,
    instance: Option<Box<dyn KeyGenerator>>,
    factory: Arc<dyn KeyGeneratorFactory>,

    codec: Codec,
    send_msg: SendMsgCb,
    events: Arc<EventHub>,

    pub_keys: PkStore,
    deals: MessageStore<Deal>,
    /// Deals that arrived before our participant index was known; they
    /// are re-filtered into the store when the index is assigned.
    pending_deals: Vec<(ValidatorAddress, usize, Deal)>,
    responses: MessageStore<Response>,
    justifications: MessageStore<Option<Justification>>,
    commits: MessageStore<SecretCommits>,
    complaints: MessageStore<Option<ComplaintCommits>>,
    reconstruct_commits: MessageStore<Option<ReconstructCommits>>,

    transitions: VecDeque<Transition>,
    losers: Vec<Loser>,
    faults: DealerFaults,
}

impl DealerState {
    #[allow(clippy::too_many_arguments)]
    fn new(
        validators: ValidatorSet,
        addr: ValidatorAddress,
        send_msg: SendMsgCb,
        events: Arc<EventHub>,
        codec: Codec,
        factory: Arc<dyn KeyGeneratorFactory>,
        round_id: RoundId,
        faults: DealerFaults,
    ) -> Self {
        let n = validators.size();

        Self {
            validators,
            addr,
            participant_id: None,
            round_id,
            sec_key: None,
            instance: None,
            factory,
            codec,
            send_msg,
            events,
            pub_keys: PkStore::new(),
            deals: MessageStore::new(config::max_messages_per_peer(MessageKind::Deal, n)),
            pending_deals: Vec::new(),
            responses: MessageStore::new(config::max_messages_per_peer(MessageKind::Response, n)),
            justifications: MessageStore::new(config::max_messages_per_peer(
                MessageKind::Justification,
                n,
            )),
            commits: MessageStore::new(config::max_messages_per_peer(MessageKind::Commits, n)),
            complaints: MessageStore::new(config::max_messages_per_peer(MessageKind::Complaint, n)),
            reconstruct_commits: MessageStore::new(config::max_messages_per_peer(
                MessageKind::ReconstructCommit,
                n,
            )),
            transitions: VecDeque::new(),
            losers: Vec::new(),
            faults,
        }
    }

    fn n(&self) -> usize {
        self.validators.size()
    }

    fn new_message(&self, kind: MessageKind) -> DkgMessage {
        DkgMessage::new(kind, self.round_id, self.addr)
    }

    fn send_messages(&self, messages: Vec<DkgMessage>) -> Result<()> {
        (self.send_msg)(messages)
    }

    fn instance(&self) -> Result<&dyn KeyGenerator> {
        self.instance
            .as_deref()
            .ok_or_else(|| anyhow::Error::new(DealerError::NoInstance))
    }

    fn instance_mut(&mut self) -> Result<&mut Box<dyn KeyGenerator>> {
        self.instance
            .as_mut()
            .ok_or_else(|| anyhow::Error::new(DealerError::NoInstance))
    }

    fn push_loser(&mut self, addr: ValidatorAddress, kind: LoserKind) {
        self.losers.push(Loser { addr, kind });
    }

    fn decode_err(
        &mut self,
        kind: MessageKind,
        from: ValidatorAddress,
        err: anyhow::Error,
        loser_kind: LoserKind,
    ) -> anyhow::Error {
        self.push_loser(from, loser_kind);

        anyhow::Error::new(DealerError::Decode {
            kind,
            from,
            reason: format!("{}", err),
        })
    }

    /// Samples the round keypair and announces the public half.
    fn announce_pub_key(&mut self) -> Result<()> {
        let sec_key = Scalar::pick();
        let pub_point = sec_key.public_point();

        let payload = self.codec.encode(&pub_point)?;

        self.sec_key = Some(sec_key);

        info!(round = %self.round_id, "dkg: sending pub key");

        let message = self.new_message(MessageKind::PubKey).with_payload(payload);
        self.send_messages(vec![message])
    }

    /// Builds the key generation instance over the sorted roster and
    /// learns our participant index from it.
    fn build_instance(&mut self, threshold: usize) -> Result<()> {
        self.pub_keys.sort();

        let sec_key = self
            .sec_key
            .take()
            .ok_or_else(|| anyhow::anyhow!("dealer was never started"))?;

        let instance = self
            .factory
            .create(sec_key, &self.pub_keys.points(), threshold)?;

        self.participant_id = Some(instance.own_index());
        self.instance = Some(instance);

        self.flush_pending_deals();

        Ok(())
    }

    /// Re-filters deals that arrived before the index was known.
    fn flush_pending_deals(&mut self) {
        let Some(own) = self.participant_id else {
            return;
        };

        for (addr, to_index, deal) in std::mem::take(&mut self.pending_deals) {
            if to_index != own || self.deals.contains(&addr) {
                continue;
            }

            let index = deal.dealer() as usize;
            self.deals.add(addr, index, deal);
        }
    }

    /// Emits our deals, applying any injected faults.
    fn emit_deals(&mut self) -> Result<()> {
        let deals = self.instance_mut()?.deals()?;

        let mut messages = Vec::with_capacity(deals.len());
        for (to_index, deal) in deals {
            let payload = if self.faults.corrupt_deals {
                vec![0xde, 0xad, 0xbe, 0xef]
            } else {
                self.codec.encode(&deal)?
            };

            messages.push(
                self.new_message(MessageKind::Deal)
                    .with_payload(payload)
                    .with_to_index(to_index),
            );
        }

        if self.faults.drop_all_deals {
            info!(round = %self.round_id, "dkg: withholding all deals");
            return Ok(());
        }

        if self.faults.drop_one_deal {
            messages.pop();
        }

        info!(round = %self.round_id, deals = messages.len(), "dkg: sending deals");

        self.send_messages(messages)
    }

    /// Runs every stored deal through the instance and emits the
    /// responses.
    fn emit_responses(&mut self) -> Result<()> {
        let deals: Vec<Deal> = self.deals.iter().cloned().collect();

        let mut messages = Vec::with_capacity(deals.len());
        for deal in &deals {
            let response = self.instance_mut()?.process_deal(deal)?;
            let payload = self.codec.encode(&response)?;

            messages.push(self.new_message(MessageKind::Response).with_payload(payload));
        }

        self.events
            .fire(DkgEvent::DealsProcessed(self.round_id));

        self.send_messages(messages)
    }

    /// Runs every stored response through the instance, emitting one
    /// justification per response. Empty placeholders stand in for the
    /// responses that needed no rebuttal, so receivers can count instead
    /// of waiting on timeouts.
    fn emit_justifications(&mut self) -> Result<()> {
        let responses: Vec<Response> = self.responses.iter().cloned().collect();

        let mut messages = Vec::with_capacity(responses.len());
        for response in &responses {
            if response.approved() {
                debug!(dealer = response.dealer(), "dkg: deal is approved");
            }

            let justification = self.instance_mut()?.process_response(response)?;

            let mut message = self.new_message(MessageKind::Justification);
            if let Some(justification) = justification {
                message = message.with_payload(self.codec.encode(&justification)?);
            }

            messages.push(message);
        }

        self.events
            .fire(DkgEvent::ResponsesProcessed(self.round_id));

        self.send_messages(messages)
    }

    /// Feeds stored justifications, checks certification, computes QUAL
    /// and emits our phase-II commits.
    fn emit_commits(&mut self) -> Result<()> {
        let justifications: Vec<Justification> =
            self.justifications.iter().flatten().cloned().collect();

        for justification in &justifications {
            info!(
                dealer = justification.dealer(),
                "dkg: processing non-empty justification"
            );
            self.instance_mut()?.process_justification(justification)?;
        }

        self.events
            .fire(DkgEvent::JustificationsProcessed(self.round_id));

        if !self.instance()?.certified() {
            return Err!(DealerError::NotCertified);
        }

        self.events
            .fire(DkgEvent::InstanceCertified(self.round_id));

        let qual = self.instance()?.qual();
        info!(round = %self.round_id, ?qual, "dkg: got the QUAL set");

        if qual.len() < self.n() {
            let missing = self.n() - qual.len();

            for index in 0..self.n() {
                if !qual.contains(&index) {
                    if let Some(addr) = self.pub_keys.addr_at(index) {
                        self.push_loser(addr, LoserKind::MissingData);
                    }
                }
            }

            return Err!(DealerError::QualIncomplete { missing });
        }

        let commits = self.instance()?.secret_commits()?;
        let num_entities = commits.commitment_len();
        let payload = self.codec.encode(&commits)?;

        if self.faults.drop_commits {
            info!(round = %self.round_id, "dkg: withholding commits");
            return Ok(());
        }

        let message = self
            .new_message(MessageKind::Commits)
            .with_payload(payload)
            .with_num_entities(num_entities);

        self.send_messages(vec![message])
    }

    /// Checks every stored commit bundle, emitting a complaint (or an
    /// empty placeholder) per bundle.
    fn emit_complaints(&mut self) -> Result<()> {
        let commits: Vec<SecretCommits> = self.commits.iter().cloned().collect();

        let mut messages = Vec::with_capacity(commits.len());
        for commit in &commits {
            let complaint = self.instance_mut()?.process_secret_commits(commit)?;

            let mut message = self.new_message(MessageKind::Complaint);
            if let Some(complaint) = complaint {
                message = message
                    .with_num_entities(complaint.commitment_len())
                    .with_payload(self.codec.encode(&complaint)?);
            }

            messages.push(message);
        }

        self.events
            .fire(DkgEvent::CommitsProcessed(self.round_id));

        self.send_messages(messages)
    }

    /// Answers every stored complaint with a reconstruct-commit (or an
    /// empty placeholder).
    fn emit_reconstruct_commits(&mut self) -> Result<()> {
        let complaints: Vec<Option<ComplaintCommits>> =
            self.complaints.iter().cloned().collect();

        let mut messages = Vec::with_capacity(complaints.len());
        for complaint in &complaints {
            let mut message = self.new_message(MessageKind::ReconstructCommit);

            if let Some(complaint) = complaint {
                let reconstruct = self.instance_mut()?.process_complaint_commits(complaint)?;

                if let Some(reconstruct) = reconstruct {
                    message = message.with_payload(self.codec.encode(&reconstruct)?);
                }
            }

            messages.push(message);
        }

        self.events
            .fire(DkgEvent::ComplaintProcessed(self.round_id));

        self.send_messages(messages)
    }

    /// Feeds stored reconstruct-commits and checks the instance came out
    /// finished.
    fn finish_reconstruction(&mut self) -> Result<()> {
        let reconstructs: Vec<ReconstructCommits> =
            self.reconstruct_commits.iter().flatten().cloned().collect();

        for reconstruct in &reconstructs {
            self.instance_mut()?
                .process_reconstruct_commits(reconstruct)?;
        }

        self.events
            .fire(DkgEvent::ReconstructCommitsProcessed(self.round_id));

        if !self.instance()?.finished() {
            return Err!(DealerError::InstanceNotFinished);
        }

        debug!(round = %self.round_id, "dkg: reconstruct commits processed, round finished");

        Ok(())
    }

    fn qual_len(&self) -> Option<usize> {
        self.instance.as_ref().map(|instance| instance.qual().len())
    }

    /*
     * Inbound handlers, one per wire kind. Policy: decode (failure puts
     * the sender on the loser list), filter, store-if-absent, pump the
     * transition queue.
     */

    fn handle_pub_key(&mut self, msg: &DkgMessage) -> Result<()> {
        let point: Point = match self.codec.decode(&msg.payload) {
            Ok(point) => point,
            Err(err) => {
                return Err(self.decode_err(
                    MessageKind::PubKey,
                    msg.from_addr,
                    err,
                    LoserKind::CorruptData,
                ))
            }
        };

        self.pub_keys.add(msg.from_addr, point);

        Ok(())
    }

    fn handle_deal(&mut self, msg: &DkgMessage) -> Result<()> {
        let deal: Deal = match self.codec.decode(&msg.payload) {
            Ok(deal) => deal,
            Err(err) => {
                return Err(self.decode_err(
                    MessageKind::Deal,
                    msg.from_addr,
                    err,
                    LoserKind::CorruptData,
                ))
            }
        };

        let to_index = msg.to_index;

        match self.participant_id {
            Some(own) if own as i32 == to_index => {}
            Some(_) => {
                debug!(
                    intended = to_index,
                    "dkg: rejecting deal (intended for another participant)"
                );
                return Ok(());
            }
            None => {
                // Our index is not assigned yet; park the deal and
                // re-filter once it is.
                self.pending_deals
                    .push((msg.from_addr, to_index as usize, deal));
                return Ok(());
            }
        }

        if self.deals.contains(&msg.from_addr) {
            debug!(from = %msg.from_addr, "dkg: deal from this address already stored");
            return Ok(());
        }

        info!("dkg: deal is intended for us, storing");

        let index = deal.dealer() as usize;
        self.deals.add(msg.from_addr, index, deal);

        Ok(())
    }

    fn handle_response(&mut self, msg: &DkgMessage) -> Result<()> {
        let response: Response = match self.codec.decode(&msg.payload) {
            Ok(response) => response,
            Err(err) => {
                return Err(self.decode_err(
                    MessageKind::Response,
                    msg.from_addr,
                    err,
                    LoserKind::CorruptData,
                ))
            }
        };

        // Our own responses come back through the local queue; the
        // instance already accounted for them when they were produced.
        if self.participant_id == Some(response.verifier() as usize) {
            debug!("dkg: skipping our own response");
            return Ok(());
        }

        let index = response.verifier() as usize;
        self.responses.add(msg.from_addr, index, response);

        Ok(())
    }

    fn handle_justification(&mut self, msg: &DkgMessage) -> Result<()> {
        let justification = if msg.is_nil() {
            None
        } else {
            match self.codec.decode::<Justification>(&msg.payload) {
                Ok(justification) => Some(justification),
                Err(err) => {
                    return Err(self.decode_err(
                        MessageKind::Justification,
                        msg.from_addr,
                        err,
                        LoserKind::CorruptJustification,
                    ))
                }
            }
        };

        self.justifications.add(msg.from_addr, 0, justification);

        Ok(())
    }

    fn handle_commit(&mut self, msg: &DkgMessage) -> Result<()> {
        let commits: SecretCommits = match self.codec.decode(&msg.payload) {
            Ok(commits) => commits,
            Err(err) => {
                return Err(self.decode_err(
                    MessageKind::Commits,
                    msg.from_addr,
                    err,
                    LoserKind::CorruptData,
                ))
            }
        };

        let index = commits.dealer() as usize;
        self.commits.add(msg.from_addr, index, commits);

        Ok(())
    }

    fn handle_complaint(&mut self, msg: &DkgMessage) -> Result<()> {
        let complaint = if msg.is_nil() {
            None
        } else {
            match self.codec.decode::<ComplaintCommits>(&msg.payload) {
                Ok(complaint) => Some(complaint),
                Err(err) => {
                    return Err(self.decode_err(
                        MessageKind::Complaint,
                        msg.from_addr,
                        err,
                        LoserKind::CorruptData,
                    ))
                }
            }
        };

        self.complaints.add(msg.from_addr, 0, complaint);

        Ok(())
    }

    fn handle_reconstruct_commit(&mut self, msg: &DkgMessage) -> Result<()> {
        let reconstruct = if msg.is_nil() {
            None
        } else {
            match self.codec.decode::<ReconstructCommits>(&msg.payload) {
                Ok(reconstruct) => Some(reconstruct),
                Err(err) => {
                    return Err(self.decode_err(
                        MessageKind::ReconstructCommit,
                        msg.from_addr,
                        err,
                        LoserKind::CorruptData,
                    ))
                }
            }
        };

        self.reconstruct_commits.add(msg.from_addr, 0, reconstruct);

        Ok(())
    }

    /// Checks the message signature against the sender's entry in the
    /// round's validator set.
    fn verify_message(&self, msg: &DkgMessage) -> Result<()> {
        let validator = self
            .validators
            .get_by_address(&msg.from_addr)
            .ok_or(DealerError::UnknownSender {
                from: msg.from_addr,
            })?;

        let sign_bytes = msg.sign_bytes(&self.codec)?;
        let signature = Signature::from_bytes(&msg.signature).map_err(|_| {
            DealerError::SignatureInvalid {
                from: msg.from_addr,
            }
        })?;

        validator
            .pub_key()
            .verify(&sign_bytes, &signature)
            .map_err(|_| {
                anyhow::Error::new(DealerError::SignatureInvalid {
                    from: msg.from_addr,
                })
            })
    }

    fn pop_losers(&mut self) -> Vec<Loser> {
        let mut out: Vec<Loser> = Vec::new();

        for loser in self.losers.drain(..) {
            if !out.contains(&loser) {
                out.push(loser);
            }
        }

        out
    }
}

/// The full surface the round manager drives a dealer through.
pub trait Dealer: Send + Sync {
    /// Kicks the round off by announcing the fresh round public key.
    fn start(&mut self) -> Result<()>;

    fn round_id(&self) -> RoundId;

    fn participant_id(&self) -> Option<usize>;

    /// Runs the transition queue until the head is not ready.
    fn transit(&mut self) -> Result<()>;

    fn verify_message(&self, msg: &DkgMessage) -> Result<()>;

    fn handle_pub_key(&mut self, msg: &DkgMessage) -> Result<()>;
    fn handle_deal(&mut self, msg: &DkgMessage) -> Result<()>;
    fn handle_response(&mut self, msg: &DkgMessage) -> Result<()>;
    fn handle_justification(&mut self, msg: &DkgMessage) -> Result<()>;
    fn handle_commit(&mut self, msg: &DkgMessage) -> Result<()>;
    fn handle_complaint(&mut self, msg: &DkgMessage) -> Result<()>;
    fn handle_reconstruct_commit(&mut self, msg: &DkgMessage) -> Result<()>;

    /// Dispatches a verified message to the handler for its kind and
    /// pumps the transition queue.
    fn handle_message(&mut self, msg: &DkgMessage) -> Result<()> {
        match msg.kind {
            MessageKind::PubKey => self.handle_pub_key(msg)?,
            MessageKind::Deal => self.handle_deal(msg)?,
            MessageKind::Response => self.handle_response(msg)?,
            MessageKind::Justification => self.handle_justification(msg)?,
            MessageKind::Commits => self.handle_commit(msg)?,
            MessageKind::Complaint => self.handle_complaint(msg)?,
            MessageKind::ReconstructCommit => self.handle_reconstruct_commit(msg)?,
        }

        self.transit()
    }

    /// The round's verifier. Returns [`DealerError::VerifierNotReady`]
    /// for as long as the round is in flight.
    fn verifier(&self) -> Result<BlsVerifier>;

    fn losers(&self) -> &[Loser];

    /// Returns the loser list, deduplicated, and clears it.
    fn pop_losers(&mut self) -> Vec<Loser>;
}

/// The off-chain dealer: the seven-phase protocol over direct messaging.
pub struct DkgDealer {
    state: DealerState,
}

impl DkgDealer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        validators: ValidatorSet,
        addr: ValidatorAddress,
        send_msg: SendMsgCb,
        events: Arc<EventHub>,
        codec: Codec,
        factory: Arc<dyn KeyGeneratorFactory>,
        round_id: RoundId,
        faults: DealerFaults,
    ) -> Self {
        Self {
            state: DealerState::new(
                validators, addr, send_msg, events, codec, factory, round_id, faults,
            ),
        }
    }

    fn generate_transitions(&mut self) {
        self.state.transitions = VecDeque::from(vec![
            // Phase I
            Transition::SendDeals,
            Transition::ProcessDeals,
            Transition::ProcessResponses,
            Transition::ProcessJustifications,
            // Phase II
            Transition::ProcessCommits,
            Transition::ProcessComplaints,
            Transition::ProcessReconstructCommits,
        ]);
    }

    /// Ready once the roster is full: sorts it, builds the instance with
    /// threshold 2N/3 and hands out the deals.
    fn send_deals(&mut self) -> Result<bool> {
        if self.state.pub_keys.len() != self.state.n() {
            debug!(
                have = self.state.pub_keys.len(),
                want = self.state.n(),
                "dkg: send deals not ready"
            );
            return Ok(false);
        }

        self.state.events.fire(DkgEvent::PubKeyReceived);

        let threshold = (self.state.n() * 2) / 3;
        self.state.build_instance(threshold)?;
        self.state.emit_deals()?;

        Ok(true)
    }

    fn process_deals(&mut self) -> Result<bool> {
        if self.state.deals.messages_count() < self.state.n() - 1 {
            debug!(
                have = self.state.deals.messages_count(),
                "dkg: process deals not ready"
            );
            return Ok(false);
        }

        info!(round = %self.state.round_id, "dkg: processing deals");
        self.state.emit_responses()?;

        Ok(true)
    }

    fn process_responses(&mut self) -> Result<bool> {
        let wanted = (self.state.n() - 1) * (self.state.n() - 1);

        if self.state.responses.messages_count() < wanted {
            debug!(
                have = self.state.responses.messages_count(),
                want = wanted,
                "dkg: process responses not ready"
            );
            return Ok(false);
        }

        self.state.emit_justifications()?;

        Ok(true)
    }

    fn process_justifications(&mut self) -> Result<bool> {
        let n = self.state.n();
        let wanted = n * (n - 1) * (n - 1);

        if self.state.justifications.messages_count() < wanted {
            debug!(
                have = self.state.justifications.messages_count(),
                want = wanted,
                "dkg: process justifications not ready"
            );
            return Ok(false);
        }

        info!(round = %self.state.round_id, "dkg: processing justifications");
        self.state.emit_commits()?;

        Ok(true)
    }

    fn process_commits(&mut self) -> Result<bool> {
        let Some(qual) = self.state.qual_len() else {
            return Ok(false);
        };

        if self.state.commits.messages_count() < qual {
            debug!(
                have = self.state.commits.messages_count(),
                want = qual,
                "dkg: process commits not ready"
            );
            return Ok(false);
        }

        info!(round = %self.state.round_id, "dkg: processing commits");
        self.state.emit_complaints()?;

        Ok(true)
    }

    fn process_complaints(&mut self) -> Result<bool> {
        let Some(qual) = self.state.qual_len() else {
            return Ok(false);
        };

        if self.state.complaints.messages_count() < qual - 1 {
            debug!(
                have = self.state.complaints.messages_count(),
                want = qual - 1,
                "dkg: process complaints not ready"
            );
            return Ok(false);
        }

        info!(round = %self.state.round_id, "dkg: processing complaints");
        self.state.emit_reconstruct_commits()?;

        Ok(true)
    }

    fn process_reconstruct_commits(&mut self) -> Result<bool> {
        let Some(qual) = self.state.qual_len() else {
            return Ok(false);
        };

        if self.state.reconstruct_commits.messages_count() < qual - 1 {
            debug!(
                have = self.state.reconstruct_commits.messages_count(),
                want = qual - 1,
                "dkg: process reconstruct commits not ready"
            );
            return Ok(false);
        }

        self.state.finish_reconstruction()?;

        Ok(true)
    }
}

impl Dealer for DkgDealer {
    fn start(&mut self) -> Result<()> {
        self.generate_transitions();
        self.state.announce_pub_key()
    }

    fn round_id(&self) -> RoundId {
        self.state.round_id()
    }

    fn participant_id(&self) -> Option<usize> {
        self.state.participant_id()
    }

    fn transit(&mut self) -> Result<()> {
        while let Some(transition) = self.state.transitions.front().copied() {
            let ready = match transition {
                Transition::SendDeals => self.send_deals()?,
                Transition::ProcessDeals => self.process_deals()?,
                Transition::ProcessResponses => self.process_responses()?,
                Transition::ProcessJustifications => self.process_justifications()?,
                Transition::ProcessCommits => self.process_commits()?,
                Transition::ProcessComplaints => self.process_complaints()?,
                Transition::ProcessReconstructCommits => self.process_reconstruct_commits()?,
                Transition::SendCommits => unreachable!("off-chain dealers never send early commits"),
            };

            if !ready {
                debug!(
                    pending = self.state.transitions.len(),
                    "dkg: transition not ready"
                );
                return Ok(());
            }

            self.state.transitions.pop_front();
        }

        Ok(())
    }

    fn verify_message(&self, msg: &DkgMessage) -> Result<()> {
        self.state.verify_message(msg)
    }

    fn handle_pub_key(&mut self, msg: &DkgMessage) -> Result<()> {
        self.state.handle_pub_key(msg)
    }

    fn handle_deal(&mut self, msg: &DkgMessage) -> Result<()> {
        self.state.handle_deal(msg)
    }

    fn handle_response(&mut self, msg: &DkgMessage) -> Result<()> {
        self.state.handle_response(msg)
    }

    fn handle_justification(&mut self, msg: &DkgMessage) -> Result<()> {
        self.state.handle_justification(msg)
    }

    fn handle_commit(&mut self, msg: &DkgMessage) -> Result<()> {
        self.state.handle_commit(msg)
    }

    fn handle_complaint(&mut self, msg: &DkgMessage) -> Result<()> {
        self.state.handle_complaint(msg)
    }

    fn handle_reconstruct_commit(&mut self, msg: &DkgMessage) -> Result<()> {
        self.state.handle_reconstruct_commit(msg)
    }

    fn verifier(&self) -> Result<BlsVerifier> {
        let instance = match self.state.instance.as_deref() {
            Some(instance) if instance.finished() => instance,
            _ => return Err!(DealerError::VerifierNotReady),
        };

        let share = instance.dist_key_share()?;

        let n = self.state.n();
        let t = (n * 2) / 3 + 1;

        Ok(BlsVerifier::from_dist_key_share(share, t, n))
    }

    fn losers(&self) -> &[Loser] {
        &self.state.losers
    }

    fn pop_losers(&mut self) -> Vec<Loser> {
        self.state.pop_losers()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::crypto::signature::KeyPair;
    use crate::crypto::threshold::{PolyKeyGenerator, PolyKeyGeneratorFactory};
    use crate::validators::Validator;

    use super::*;

    const NODES: usize = 4;

    struct TestBench {
        dealer: DkgDealer,
        /// Everything the dealer emitted through its send callback.
        sent: Arc<Mutex<Vec<DkgMessage>>>,
        /// (address, per-round scalar) of every committee member, sorted
        /// the way the roster sorts.
        members: Vec<(ValidatorAddress, Scalar, Point)>,
        codec: Codec,
    }

    fn bench() -> TestBench {
        let keys: Vec<KeyPair> = (0..NODES)
            .map(|_| KeyPair::generate_key_pair().unwrap())
            .collect();

        let validators = ValidatorSet::new(
            keys.iter()
                .map(|key| Validator::new(key.public_key()))
                .collect(),
        );

        let mut members: Vec<(ValidatorAddress, Scalar, Point)> = keys
            .iter()
            .map(|key| {
                let scalar = Scalar::pick();
                let point = scalar.public_point();
                (key.address(), scalar, point)
            })
            .collect();
        members.sort_by(|(a, _, _), (b, _, _)| a.cmp(b));

        let sent: Arc<Mutex<Vec<DkgMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let send_msg: SendMsgCb = Arc::new(move |messages| {
            sink.lock().unwrap().extend(messages);
            Ok(())
        });

        let addr = members[0].0;

        let dealer = DkgDealer::new(
            validators,
            addr,
            send_msg,
            EventHub::new(),
            Codec::new(),
            PolyKeyGeneratorFactory::arced(),
            RoundId::ONE,
            DealerFaults::default(),
        );

        TestBench {
            dealer,
            sent,
            members,
            codec: Codec::new(),
        }
    }

    impl TestBench {
        fn own_scalar(&mut self) {
            // The dealer under test is member 0; its announced round key
            // must match the scalar the peers believe it has, so we
            // overwrite the sampled one.
            let scalar = Scalar::pick();
            let point = scalar.public_point();

            self.dealer.state.sec_key = Some(Scalar(scalar.0.clone()));
            self.members[0].1 = scalar;
            self.members[0].2 = point;
        }

        fn pub_key_msg(&self, member: usize) -> DkgMessage {
            let (addr, _, point) = &self.members[member];

            DkgMessage::new(MessageKind::PubKey, RoundId::ONE, *addr)
                .with_payload(self.codec.encode(point).unwrap())
        }

        fn feed_all_pub_keys(&mut self) {
            self.dealer.start().unwrap();
            self.own_scalar();

            for member in 0..NODES {
                let msg = self.pub_key_msg(member);
                self.dealer.handle_message(&msg).unwrap();
            }
        }

        /// A generator for the committee member at roster `index`.
        fn generator_for(&self, index: usize) -> PolyKeyGenerator {
            let points: Vec<Point> = self
                .members
                .iter()
                .map(|(_, _, point)| point.clone())
                .collect();

            let scalar = Scalar(self.members[index].1 .0.clone());

            PolyKeyGenerator::new(scalar, &points, (NODES * 2) / 3).unwrap()
        }
    }

    #[test]
    fn deals_go_out_once_the_roster_is_full() {
        let mut bench = bench();
        bench.feed_all_pub_keys();

        assert_eq!(bench.dealer.participant_id(), Some(0));

        let sent = bench.sent.lock().unwrap();
        let deals = sent
            .iter()
            .filter(|msg| msg.kind == MessageKind::Deal)
            .count();

        assert_eq!(deals, NODES - 1);
    }

    #[test]
    fn replayed_pub_keys_do_not_drift_the_roster() {
        let mut bench = bench();
        bench.feed_all_pub_keys();

        let before = bench.dealer.state.pub_keys.len();

        let replay = bench.pub_key_msg(2);
        bench.dealer.handle_message(&replay).unwrap();

        assert_eq!(bench.dealer.state.pub_keys.len(), before);
    }

    #[test]
    fn deals_for_other_recipients_are_not_stored() {
        let mut bench = bench();
        bench.feed_all_pub_keys();

        let mut peer = bench.generator_for(1);
        let deals = peer.deals().unwrap();

        // Addressed to participant 2, received by participant 0.
        let foreign = DkgMessage::new(MessageKind::Deal, RoundId::ONE, bench.members[1].0)
            .with_payload(bench.codec.encode(deals.get(&2).unwrap()).unwrap())
            .with_to_index(2);

        bench.dealer.handle_message(&foreign).unwrap();

        assert_eq!(bench.dealer.state.deals.messages_count(), 0);
    }

    #[test]
    fn duplicate_deals_from_one_address_are_dropped() {
        let mut bench = bench();
        bench.feed_all_pub_keys();

        let mut peer = bench.generator_for(1);
        let deals = peer.deals().unwrap();

        let msg = DkgMessage::new(MessageKind::Deal, RoundId::ONE, bench.members[1].0)
            .with_payload(bench.codec.encode(deals.get(&0).unwrap()).unwrap())
            .with_to_index(0);

        bench.dealer.handle_message(&msg).unwrap();
        bench.dealer.handle_message(&msg).unwrap();

        assert_eq!(bench.dealer.state.deals.messages_count(), 1);
    }

    #[test]
    fn undecodable_payloads_put_the_sender_on_the_loser_list() {
        let mut bench = bench();
        bench.feed_all_pub_keys();

        let garbage = DkgMessage::new(MessageKind::Deal, RoundId::ONE, bench.members[3].0)
            .with_payload(vec![0xde, 0xad, 0xbe, 0xef])
            .with_to_index(0);

        let err = bench.dealer.handle_message(&garbage).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DealerError>(),
            Some(DealerError::Decode { .. })
        ));

        let losers = bench.dealer.pop_losers();
        assert_eq!(losers.len(), 1);
        assert_eq!(losers[0].addr, bench.members[3].0);
        assert_eq!(losers[0].kind, LoserKind::CorruptData);
    }

    #[test]
    fn verifier_is_not_ready_mid_round() {
        let mut bench = bench();
        bench.feed_all_pub_keys();

        let err = bench.dealer.verifier().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DealerError>(),
            Some(DealerError::VerifierNotReady)
        ));
    }

    #[test]
    fn popped_losers_collapse_duplicates() {
        let mut bench = bench();
        bench.feed_all_pub_keys();

        for _ in 0..3 {
            let garbage = DkgMessage::new(MessageKind::Deal, RoundId::ONE, bench.members[3].0)
                .with_payload(vec![0xff])
                .with_to_index(0);

            let _ = bench.dealer.handle_message(&garbage);
        }

        let losers = bench.dealer.pop_losers();
        assert_eq!(losers.len(), 1);
        assert!(bench.dealer.losers().is_empty());
    }
}
