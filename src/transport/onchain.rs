//! The transaction-broadcast binding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use strum::IntoEnumIterator;
use tracing::{debug, info};

use crate::circuit_breaker::CircuitBreaker;
use crate::crypto::threshold::{BlsVerifier, KeyGeneratorFactory, PolyKeyGeneratorFactory};
use crate::dealer::{Dealer, DealerError, DealerFaults, Loser, OnChainDealer, SendMsgCb};
use crate::error::*;
use crate::events::EventHub;
use crate::messages::{Codec, DkgMessage, MessageKind, MsgSendDkgData};
use crate::ordering::RoundId;
use crate::validators::{PrivValidator, ValidatorSet};

use super::{dkg_data_path, ChainClient, TransportError};

const BROADCAST_RETRIES: usize = 3;

/// Runs the engine over chain state.
///
/// Outbound messages are signed, wrapped into transactions and
/// broadcast with a monotonically increasing account sequence. Inbound
/// messages are pulled from the chain once per block, for every message
/// kind of the active round; the same message is retrieved repeatedly,
/// which the dealers' store-if-absent policy makes harmless.
pub struct OnChainTransport {
    client: Arc<dyn ChainClient>,
    codec: Codec,
    events: Arc<EventHub>,
    priv_validator: Arc<dyn PrivValidator>,
    factory: Arc<dyn KeyGeneratorFactory>,
    dealer: Mutex<Option<Box<dyn Dealer>>>,
    account_sequence: Arc<AtomicU64>,
}

impl OnChainTransport {
    pub fn new(
        client: Arc<dyn ChainClient>,
        events: Arc<EventHub>,
        priv_validator: Arc<dyn PrivValidator>,
        codec: Codec,
    ) -> Self {
        Self {
            client,
            codec,
            events,
            priv_validator,
            factory: PolyKeyGeneratorFactory::arced(),
            dealer: Mutex::new(None),
            account_sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Swaps the key generator factory; tests script the crypto this way.
    pub fn with_key_generator_factory(mut self, factory: Arc<dyn KeyGeneratorFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Signs outbound messages, wraps them into transactions and
    /// broadcasts the batch, bumping the account sequence per batch.
    fn send_msg_cb(&self) -> SendMsgCb {
        let client = self.client.clone();
        let codec = self.codec;
        let priv_validator = self.priv_validator.clone();
        let sequence = self.account_sequence.clone();

        Arc::new(move |messages: Vec<DkgMessage>| {
            let mut txs = Vec::with_capacity(messages.len());

            for mut message in messages {
                let sign_bytes = message.sign_bytes(&codec)?;
                let signature = priv_validator.sign_bytes(&sign_bytes)?;
                message.set_signature(signature.as_ref().to_vec());

                let tx = MsgSendDkgData::new(message, priv_validator.address());
                tx.validate_basic()?;

                txs.push(tx);
            }

            if txs.is_empty() {
                return Ok(());
            }

            let sequence = sequence.fetch_add(1, Ordering::SeqCst);

            debug!(count = txs.len(), sequence, "dkg: broadcasting transactions");

            CircuitBreaker::execute_in_circuit_breaker(
                || client.broadcast_txs(&txs, sequence),
                Some(BROADCAST_RETRIES),
            )
            .map_err(|err| {
                TransportError::BroadcastFailed {
                    count: txs.len(),
                    reason: format!("{:?}", err),
                }
                .into()
            })
        })
    }

    /// Starts the round on this transport with a fresh on-chain dealer.
    pub fn start_round(&self, validators: &ValidatorSet, round_id: RoundId) -> Result<()> {
        info!(round = %round_id, "dkg: starting on-chain round");

        let mut dealer = OnChainDealer::new(
            validators.clone(),
            self.priv_validator.address(),
            self.send_msg_cb(),
            self.events.clone(),
            self.codec,
            self.factory.clone(),
            round_id,
            DealerFaults::default(),
        );

        dealer.start()?;

        *self.dealer.lock().expect("on-chain dealer lock poisoned") = Some(Box::new(dealer));

        Ok(())
    }

    /// Pulls every message kind of `round_id` from the chain and feeds
    /// them to the dealer.
    ///
    /// Returns `true` once the dealer's verifier is ready; `false` while
    /// the round needs more blocks.
    pub fn process_block(&self, round_id: RoundId) -> Result<bool> {
        let mut guard = self.dealer.lock().expect("on-chain dealer lock poisoned");
        let dealer = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("on-chain round was never started"))?;

        for kind in MessageKind::iter() {
            let path = dkg_data_path(kind, round_id);

            let raw = self.client.query_with_data(&path).map_err(|err| {
                anyhow::Error::new(TransportError::QueryFailed {
                    path: path.clone(),
                    reason: format!("{:?}", err),
                })
            })?;

            let messages: Vec<MsgSendDkgData> = self.codec.decode(&raw)?;

            let count = messages.len();
            for tx in messages {
                dealer.handle_message(&tx.data)?;
            }

            if count > 0 {
                debug!(?kind, count, "dkg: pulled messages from chain");
            }
        }

        match dealer.verifier() {
            Ok(_) => Ok(true),
            Err(err) => match err.downcast_ref::<DealerError>() {
                Some(DealerError::VerifierNotReady) => Ok(false),
                _ => Err(err.context("dkg round failed")),
            },
        }
    }

    /// The finished round's verifier.
    pub fn verifier(&self) -> Result<BlsVerifier> {
        let guard = self.dealer.lock().expect("on-chain dealer lock poisoned");

        guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("on-chain round was never started"))?
            .verifier()
    }

    pub fn pop_losers(&self) -> Vec<Loser> {
        let mut guard = self.dealer.lock().expect("on-chain dealer lock poisoned");

        guard
            .as_mut()
            .map(|dealer| dealer.pop_losers())
            .unwrap_or_default()
    }
}
