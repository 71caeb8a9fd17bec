//! The on-chain dealer variant.
//!
//! When every protocol message is a public transaction, the protocol
//! compresses to four steps with commitments published *before* any deal:
//! `SendCommits → SendDeals → ProcessDeals → ProcessResponses`. A
//! receiver compares the commitments inside a deal against the values the
//! dealer committed to on chain and flags mismatches straight onto the
//! loser list; responses double as rejections, so the justification,
//! complaint and reconstruction phases disappear. The resulting BLS
//! threshold is one lower than the off-chain variant's.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use crate::crypto::signature::ValidatorAddress;
use crate::crypto::threshold::{BlsVerifier, Deal, KeyGeneratorFactory, Response, SecretCommits};
use crate::error::*;
use crate::events::{DkgEvent, EventHub};
use crate::messages::{Codec, DkgMessage, MessageKind};
use crate::ordering::RoundId;
use crate::validators::ValidatorSet;
use crate::Err;

use super::{
    Dealer, DealerError, DealerFaults, DealerState, Loser, LoserKind, SendMsgCb, Transition,
};

pub struct OnChainDealer {
    state: DealerState,
}

impl OnChainDealer {
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
            Transition::SendCommits,
            Transition::SendDeals,
            Transition::ProcessDeals,
            Transition::ProcessResponses,
        ]);
    }

    /// The number of partial signatures the on-chain variant requires.
    fn bls_threshold(n: usize) -> usize {
        (n * 2) / 3
    }

    /// Ready once the roster is full: builds the instance and publishes
    /// our commitments ahead of any deal.
    fn send_commits(&mut self) -> Result<bool> {
        if self.state.pub_keys.len() != self.state.n() {
            debug!(
                have = self.state.pub_keys.len(),
                want = self.state.n(),
                "dkg: send commits not ready"
            );
            return Ok(false);
        }

        let threshold = Self::bls_threshold(self.state.n()).saturating_sub(1);
        self.state.build_instance(threshold)?;

        let commits = self.state.instance()?.commits();
        let num_entities = commits.commitment_len();
        let payload = self.state.codec.encode(&commits)?;

        if self.state.faults.drop_commits {
            info!(round = %self.state.round_id(), "dkg: withholding commits");
            return Ok(true);
        }

        let message = self
            .state
            .new_message(MessageKind::Commits)
            .with_payload(payload)
            .with_num_entities(num_entities);

        self.state.send_messages(vec![message])?;

        debug!(round = %self.state.round_id(), "dkg: sent commits");

        Ok(true)
    }

    /// Ready once every participant's commitments are on chain.
    fn send_deals(&mut self) -> Result<bool> {
        if self.state.commits.messages_count() < self.state.n() {
            debug!(
                have = self.state.commits.messages_count(),
                want = self.state.n(),
                "dkg: send deals awaiting commits"
            );
            return Ok(false);
        }

        self.state.events.fire(DkgEvent::PubKeyReceived);
        self.state.emit_deals()?;

        Ok(true)
    }

    /// Compares a deal's embedded commitments against the values the
    /// dealer committed to on chain.
    fn deal_commits_match(&self, deal: &Deal) -> bool {
        let published = self
            .state
            .commits
            .values_for_index(deal.dealer() as usize)
            .and_then(|bucket| bucket.first());

        match published {
            Some(commits) => *commits.commitment() == deal.row_zero_commitment(),
            None => false,
        }
    }

    fn process_deals(&mut self) -> Result<bool> {
        if self.state.deals.messages_count() < self.state.n() - 1 {
            debug!(
                have = self.state.deals.messages_count(),
                want = self.state.n() - 1,
                "dkg: process deals not ready"
            );
            return Ok(false);
        }

        let own = self.state.participant_id();

        let deals: Vec<(ValidatorAddress, Deal)> = self
            .state
            .deals
            .iter_by_addr()
            .flat_map(|(addr, bucket)| bucket.iter().map(|deal| (*addr, deal.clone())))
            .collect();

        let mut messages = Vec::with_capacity(deals.len());
        for (dealer_addr, deal) in deals {
            if Some(deal.dealer() as usize) == own {
                continue;
            }

            let response = self.state.instance_mut()?.process_deal(&deal)?;
            let commits_ok = self.deal_commits_match(&deal);

            // A dealer whose deal was rejected, or whose deal disagrees
            // with its published commitments, goes on the loser list.
            if !response.approved() || !commits_ok {
                self.state.push_loser(dealer_addr, LoserKind::CorruptData);
            }

            let payload = self.state.codec.encode(&response)?;
            messages.push(
                self.state
                    .new_message(MessageKind::Response)
                    .with_payload(payload),
            );
        }

        self.state
            .events
            .fire(DkgEvent::DealsProcessed(self.state.round_id()));

        debug!(responses = messages.len(), "dkg: sending response messages");
        self.state.send_messages(messages)?;

        Ok(true)
    }

    fn process_responses(&mut self) -> Result<bool> {
        let n = self.state.n();
        let wanted = (n - 1) * (n - 1);

        if self.state.responses.messages_count() < wanted {
            debug!(
                have = self.state.responses.messages_count(),
                want = wanted,
                "dkg: process responses not ready"
            );
            return Ok(false);
        }

        let responses: Vec<Response> = self.state.responses.iter().cloned().collect();
        for response in &responses {
            if Some(response.verifier() as usize) == self.state.participant_id() {
                continue;
            }

            self.state.instance_mut()?.process_response(response)?;
        }

        self.state
            .events
            .fire(DkgEvent::ResponsesProcessed(self.state.round_id()));

        if !self.state.instance()?.certified() {
            return Err!(DealerError::NotCertified);
        }

        self.state
            .events
            .fire(DkgEvent::InstanceCertified(self.state.round_id()));

        // Responses double as rejections here, so certification closes
        // the round: replay the published commitments through the
        // instance to settle every contribution.
        let commits: Vec<SecretCommits> = self.state.commits.iter().cloned().collect();
        for commit in &commits {
            if self
                .state
                .instance_mut()?
                .process_secret_commits(commit)?
                .is_some()
            {
                return Err!(DealerError::InstanceNotFinished);
            }
        }

        debug!(round = %self.state.round_id(), "dkg: on-chain round complete");

        Ok(true)
    }
}

impl Dealer for OnChainDealer {
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
                Transition::SendCommits => self.send_commits()?,
                Transition::SendDeals => self.send_deals()?,
                Transition::ProcessDeals => self.process_deals()?,
                Transition::ProcessResponses => self.process_responses()?,
                _ => unreachable!("phase absent from the on-chain variant"),
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
            Some(instance) if instance.certified() && instance.finished() => instance,
            _ => return Err!(DealerError::VerifierNotReady),
        };

        let share = instance.dist_key_share()?;

        let n = self.state.n();
        let t = Self::bls_threshold(n);

        Ok(BlsVerifier::from_dist_key_share(share, t, n))
    }

    fn losers(&self) -> &[Loser] {
        &self.state.losers
    }

    fn pop_losers(&mut self) -> Vec<Loser> {
        self.state.pop_losers()
    }
}
