//! The multi-round lifecycle on top of the dealers.
//!
//! The round manager demultiplexes inbound shares by round id, creates
//! dealers lazily for rounds it has not seen, promotes freshly computed
//! verifiers into active use at a coordinated height, and tombstones
//! superseded rounds. All dealer state is reached through the single
//! read-write lock held here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, info};

use crate::channel::{self, ChannelMixedRx, ChannelMixedTx, TrySendReturnError};
use crate::config::DkgConfig;
use crate::crypto::threshold::{BlsVerifier, PolyKeyGeneratorFactory};
use crate::dealer::{Dealer, DealerError, DealerFaults, DkgDealer, Loser, SendMsgCb};
use crate::error::*;
use crate::events::{DkgEvent, EventHub};
use crate::messages::{Codec, DkgMessage};
use crate::ordering::{Height, RoundId};
use crate::validators::{PrivValidator, ValidatorSet};
use crate::{async_runtime, Err};

/// Builds a dealer for a fresh round. Swappable so tests can inject
/// scripted crypto or fault rigs.
pub type DealerConstructor = Arc<
    dyn Fn(
            ValidatorSet,
            crate::crypto::signature::ValidatorAddress,
            SendMsgCb,
            Arc<EventHub>,
            Codec,
            RoundId,
        ) -> Box<dyn Dealer>
        + Send
        + Sync,
>;

/// What handling one share did to the round it belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShareOutcome {
    /// Stored (or dropped); the round is still in flight.
    Pending,
    /// The round computed a verifier, scheduled for the carried height.
    VerifierReady { change_height: Height },
    /// The dealer failed mid-round and was tombstoned.
    RoundFailed,
    /// The dealer should have produced a verifier but could not; the
    /// message set this transport delivered is corrupt.
    VerifierFailed,
}

struct RoundState {
    verifier: Option<Arc<BlsVerifier>>,
    next_verifier: Option<Arc<BlsVerifier>>,
    change_height: Height,
    /// `None` entries are tombstones of superseded or failed rounds.
    round_to_dealer: HashMap<RoundId, Option<Box<dyn Dealer>>>,
    round_id: RoundId,
}

pub struct RoundManager {
    state: RwLock<RoundState>,
    config: DkgConfig,
    priv_validator: Arc<dyn PrivValidator>,
    codec: Codec,
    events: Arc<EventHub>,
    msg_queue_tx: ChannelMixedTx<DkgMessage>,
    msg_queue_rx: ChannelMixedRx<DkgMessage>,
    new_dealer: DealerConstructor,
}

impl RoundManager {
    pub fn new(
        events: Arc<EventHub>,
        config: DkgConfig,
        priv_validator: Arc<dyn PrivValidator>,
        codec: Codec,
    ) -> Self {
        let (msg_queue_tx, msg_queue_rx) = channel::new_bounded_mixed(config.msg_queue_size());

        Self {
            state: RwLock::new(RoundState {
                verifier: None,
                next_verifier: None,
                change_height: Height::ZERO,
                round_to_dealer: HashMap::new(),
                round_id: RoundId::ZERO,
            }),
            config,
            priv_validator,
            codec,
            events,
            msg_queue_tx,
            msg_queue_rx,
            new_dealer: Arc::new(|validators, addr, send_msg, events, codec, round_id| {
                Box::new(DkgDealer::new(
                    validators,
                    addr,
                    send_msg,
                    events,
                    codec,
                    PolyKeyGeneratorFactory::arced(),
                    round_id,
                    DealerFaults::default(),
                ))
            }),
        }
    }

    /// Replaces the dealer constructor; used to inject scripted crypto
    /// or byzantine fault rigs.
    pub fn with_dealer_constructor(mut self, constructor: DealerConstructor) -> Self {
        self.new_dealer = constructor;
        self
    }

    /// Seeds the active verifier, e.g. from genesis state.
    pub fn with_verifier(self, verifier: Arc<BlsVerifier>) -> Self {
        self.state
            .write()
            .expect("round manager lock poisoned")
            .verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &DkgConfig {
        &self.config
    }

    /// The callback dealers emit through: sign with the consensus key,
    /// broadcast on the event bus, and queue locally so this node
    /// processes its own messages (broadcast does not echo).
    fn send_signed_messages_cb(&self) -> SendMsgCb {
        let priv_validator = self.priv_validator.clone();
        let codec = self.codec;
        let events = self.events.clone();
        let queue = self.msg_queue_tx.clone();

        Arc::new(move |messages: Vec<DkgMessage>| {
            for mut message in messages {
                let sign_bytes = message.sign_bytes(&codec)?;
                let signature = priv_validator.sign_bytes(&sign_bytes)?;
                message.set_signature(signature.as_ref().to_vec());

                events.fire(DkgEvent::Data(message.clone()));

                match queue.try_send_return(message) {
                    Ok(()) => {}
                    Err(TrySendReturnError::Full(message)) => {
                        info!("dkg msg queue is full, pushing from a detached task");

                        let queue = queue.clone();
                        async_runtime::spawn(async move {
                            if let Err(err) = queue.send_async(message).await {
                                error!("failed to push dkg message: {:?}", err);
                            }
                        });
                    }
                    Err(err) => {
                        return Err!(crate::channel::TrySendError::from(err));
                    }
                }
            }

            Ok(())
        })
    }

    fn make_dealer(&self, validators: &ValidatorSet, round_id: RoundId) -> Box<dyn Dealer> {
        (self.new_dealer)(
            validators.clone(),
            self.priv_validator.address(),
            self.send_signed_messages_cb(),
            self.events.clone(),
            self.codec,
            round_id,
        )
    }

    /// Routes one verified share into its round's dealer, creating the
    /// round on first contact, and promotes the dealer's verifier when
    /// the round completes.
    pub fn handle_share(
        &self,
        msg: &DkgMessage,
        height: Height,
        validators: &ValidatorSet,
    ) -> ShareOutcome {
        let mut state = self.state.write().expect("round manager lock poisoned");

        let round_id = msg.round_id;

        if !state.round_to_dealer.contains_key(&round_id) {
            debug!(round = %round_id, "dkg: dealer not found, creating a new dealer");

            let mut dealer = self.make_dealer(validators, round_id);
            if let Err(err) = dealer.start() {
                error!(round = %round_id, "dkg: failed to start dealer: {:?}", err);
                state.round_to_dealer.insert(round_id, None);
                return ShareOutcome::RoundFailed;
            }

            state.round_to_dealer.insert(round_id, Some(dealer));
        }

        let Some(Some(dealer)) = state.round_to_dealer.get_mut(&round_id) else {
            debug!(round = %round_id, "dkg: received message for inactive round");
            return ShareOutcome::Pending;
        };

        if let Err(err) = dealer.verify_message(msg) {
            info!("dkg: can't verify message: {:?}", err);
            return ShareOutcome::Pending;
        }

        debug!(from = %msg.from_addr, kind = ?msg.kind, "dkg: received message");

        if let Err(err) = dealer.handle_message(msg) {
            if let Some(DealerError::Decode { .. }) = err.downcast_ref::<DealerError>() {
                // Bad payloads put the sender on the loser list; the
                // round itself keeps going.
                info!("dkg: dropping undecodable message: {:?}", err);
                return ShareOutcome::Pending;
            }

            error!(kind = ?msg.kind, "dkg: failed to handle message: {:?}", err);
            Self::slash_losers(dealer.pop_losers());
            state.round_to_dealer.insert(round_id, None);
            return ShareOutcome::RoundFailed;
        }

        let verifier = {
            let Some(Some(dealer)) = state.round_to_dealer.get_mut(&round_id) else {
                return ShareOutcome::Pending;
            };

            match dealer.verifier() {
                Ok(verifier) => verifier,
                Err(err) => {
                    return match err.downcast_ref::<DealerError>() {
                        Some(DealerError::VerifierNotReady) => {
                            debug!("dkg: verifier not ready");
                            ShareOutcome::Pending
                        }
                        _ => {
                            error!("dkg: verifier should be ready, but it's not: {:?}", err);
                            Self::slash_losers(dealer.pop_losers());
                            state.round_to_dealer.insert(round_id, None);
                            ShareOutcome::VerifierFailed
                        }
                    }
                }
            }
        };

        info!(round = %round_id, "dkg: verifier is ready, killing older rounds");

        let superseded: Vec<RoundId> = state
            .round_to_dealer
            .keys()
            .copied()
            .filter(|round| *round < round_id)
            .collect();
        for round in superseded {
            state.round_to_dealer.insert(round, None);
        }

        let change_height = (height + self.config.blocks_ahead())
            .quantize_down(self.config.quantization());

        state.next_verifier = Some(Arc::new(verifier));
        state.change_height = change_height;

        self.events.fire(DkgEvent::Successful { change_height });

        ShareOutcome::VerifierReady { change_height }
    }

    /// Called once per block: promotes the pending verifier at its
    /// change height and starts a fresh round on the configured cadence.
    pub fn check_dkg_time(&self, height: Height, validators: &ValidatorSet) {
        {
            let mut state = self.state.write().expect("round manager lock poisoned");

            if state.change_height == height && state.next_verifier.is_some() {
                info!(%height, "dkg: time to update verifier");

                state.verifier = state.next_verifier.take();
                state.change_height = Height::ZERO;

                self.events.fire(DkgEvent::KeyChange { height });
            }
        }

        if i64::from(height) > 1 && height.is_multiple_of(self.config.num_blocks()) {
            if let Err(err) = self.start_round(validators) {
                error!("dkg: failed to start a dealer: {:?}", err);
            }
        }
    }

    /// Bumps the round counter and starts a dealer for the new round.
    pub fn start_round(&self, validators: &ValidatorSet) -> Result<()> {
        let mut state = self.state.write().expect("round manager lock poisoned");

        state.round_id = state.round_id.next();
        let round_id = state.round_id;

        info!(round = %round_id, "dkg: starting round");

        if state.round_to_dealer.contains_key(&round_id) {
            return Ok(());
        }

        let mut dealer = self.make_dealer(validators, round_id);

        self.events.fire(DkgEvent::Start(round_id));

        match dealer.start() {
            Ok(()) => {
                state.round_to_dealer.insert(round_id, Some(dealer));
                Ok(())
            }
            Err(err) => {
                state.round_to_dealer.insert(round_id, None);
                Err(err)
            }
        }
    }

    /// The most recent round this node started.
    pub fn current_round_id(&self) -> RoundId {
        self.state
            .read()
            .expect("round manager lock poisoned")
            .round_id
    }

    /// Bumps the round counter without starting a dealer; used when the
    /// round is restarted on another transport.
    pub fn bump_round_id(&self) -> RoundId {
        let mut state = self.state.write().expect("round manager lock poisoned");

        state.round_id = state.round_id.next();
        state.round_id
    }

    pub fn verifier(&self) -> Option<Arc<BlsVerifier>> {
        self.state
            .read()
            .expect("round manager lock poisoned")
            .verifier
            .clone()
    }

    pub fn set_verifier(&self, verifier: Arc<BlsVerifier>) {
        self.state
            .write()
            .expect("round manager lock poisoned")
            .verifier = Some(verifier);
    }

    /// Schedules `verifier` to replace the active one at `change_height`;
    /// this is how a verifier computed on another transport is installed.
    pub fn install_next_verifier(&self, verifier: Arc<BlsVerifier>, change_height: Height) {
        let mut state = self.state.write().expect("round manager lock poisoned");

        state.next_verifier = Some(verifier);
        state.change_height = change_height;

        self.events.fire(DkgEvent::Successful { change_height });
    }

    pub fn next_verifier(&self) -> Option<Arc<BlsVerifier>> {
        self.state
            .read()
            .expect("round manager lock poisoned")
            .next_verifier
            .clone()
    }

    pub fn change_height(&self) -> Height {
        self.state
            .read()
            .expect("round manager lock poisoned")
            .change_height
    }

    /// Whether the round has been superseded or failed.
    pub fn is_tombstone(&self, round_id: RoundId) -> bool {
        matches!(
            self.state
                .read()
                .expect("round manager lock poisoned")
                .round_to_dealer
                .get(&round_id),
            Some(None)
        )
    }

    /// Pops the loser list of the current round.
    pub fn pop_losers(&self) -> Vec<Loser> {
        let mut state = self.state.write().expect("round manager lock poisoned");
        let round_id = state.round_id;

        match state.round_to_dealer.get_mut(&round_id) {
            Some(Some(dealer)) => dealer.pop_losers(),
            _ => {
                debug!(round = %round_id, "dkg: no live dealer for the current round");
                Vec::new()
            }
        }
    }

    fn slash_losers(losers: Vec<Loser>) {
        for loser in losers {
            info!(addr = %loser.addr, kind = ?loser.kind, "dkg: slashing validator");
        }
    }

    /// The local queue carrying this node's own signed messages back to
    /// itself.
    pub fn msg_queue(&self) -> ChannelMixedRx<DkgMessage> {
        self.msg_queue_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use threshold_crypto::SecretKeySet;

    use crate::crypto::threshold::{BlsShare, BlsVerifier};
    use crate::messages::MessageKind;
    use crate::validators::{LocalPrivValidator, PrivValidator, Validator};

    use super::*;

    fn test_verifier() -> Arc<BlsVerifier> {
        let sk_set = SecretKeySet::random(2, &mut rand::thread_rng());

        Arc::new(BlsVerifier::new(
            sk_set.public_keys(),
            BlsShare::new(0, sk_set.secret_key_share(0)),
            3,
            4,
        ))
    }

    fn manager_with_committee() -> (RoundManager, ValidatorSet, Arc<EventHub>) {
        let events = EventHub::new();
        let pv = Arc::new(LocalPrivValidator::generate().unwrap());

        let validators = ValidatorSet::new(vec![Validator::new(pv.public_key())]);

        let manager = RoundManager::new(events.clone(), DkgConfig::default(), pv, Codec::new());

        (manager, validators, events)
    }

    #[test]
    fn promotion_swaps_the_verifier_only_at_the_change_height() {
        let (manager, validators, events) = manager_with_committee();
        let watcher = events.subscribe(8);

        manager.install_next_verifier(test_verifier(), Height::from(120));

        manager.check_dkg_time(Height::from(119), &validators);
        assert!(manager.verifier().is_none());
        assert_eq!(manager.change_height(), Height::from(120));

        manager.check_dkg_time(Height::from(120), &validators);
        assert!(manager.verifier().is_some());
        assert!(manager.next_verifier().is_none());
        assert_eq!(manager.change_height(), Height::ZERO);

        // Successful at install time, then the key change itself.
        assert!(matches!(
            watcher.recv().unwrap(),
            DkgEvent::Successful { change_height } if change_height == Height::from(120)
        ));
        assert!(matches!(
            watcher.recv().unwrap(),
            DkgEvent::KeyChange { height } if height == Height::from(120)
        ));
    }

    #[test]
    fn a_share_for_a_fresh_round_spawns_a_dealer() {
        let (manager, validators, _events) = manager_with_committee();
        let queue = manager.msg_queue();

        let msg = DkgMessage::new(
            MessageKind::PubKey,
            RoundId::ONE,
            validators.validators()[0].address(),
        );

        // The unsigned share itself is rejected, but the round now has a
        // live dealer that announced its own public key.
        let outcome = manager.handle_share(&msg, Height::ZERO, &validators);

        assert_eq!(outcome, ShareOutcome::Pending);
        assert!(!manager.is_tombstone(RoundId::ONE));

        let announced = queue.recv().unwrap();
        assert!(matches!(announced.kind, MessageKind::PubKey));
        assert!(!announced.signature.is_empty());
    }

    #[test]
    fn round_ids_bump_monotonically() {
        let (manager, validators, _events) = manager_with_committee();

        assert_eq!(manager.current_round_id(), RoundId::ZERO);

        manager.start_round(&validators).unwrap();
        assert_eq!(manager.current_round_id(), RoundId::ONE);

        assert_eq!(manager.bump_round_id(), RoundId::from(2));
        assert_eq!(manager.current_round_id(), RoundId::from(2));
    }
}
