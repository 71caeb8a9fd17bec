//! Ties the two transports together and owns the fallback decision.
//!
//! Shares flow through the off-chain transport until it reports that a
//! round's message set was corrupt. The orchestrator then flips to
//! on-chain, restarts the round there, and lets the block-watch worker
//! drive `process_block` once per block notification until the chain
//! yields a verifier, which is installed back into the off-chain engine
//! at a quantized change height.

use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, info};

use crate::channel::{self, ChannelMixedRx, ChannelMixedTx};
use crate::crypto::threshold::KeyGeneratorFactory;
use crate::crypto::threshold::PolyKeyGeneratorFactory;
use crate::error::*;
use crate::events::EventHub;
use crate::messages::{Codec, DkgMessage};
use crate::ordering::{Height, RoundId};
use crate::transport::{ChainClient, OffChainTransport, OnChainTransport};
use crate::validators::{PrivValidator, ValidatorSet};
use crate::{async_runtime, dealer::Loser};

pub struct Orchestrator {
    off_chain: OffChainTransport,
    chain_client: Arc<dyn ChainClient>,
    on_chain: Mutex<Option<Arc<OnChainTransport>>>,
    on_chain_round: Mutex<RoundId>,
    is_on_chain: RwLock<bool>,
    block_notify_tx: ChannelMixedTx<Height>,
    block_notify_rx: ChannelMixedRx<Height>,
    priv_validator: Arc<dyn PrivValidator>,
    codec: Codec,
    events: Arc<EventHub>,
    on_chain_factory: Arc<dyn KeyGeneratorFactory>,
}

impl Orchestrator {
    pub fn new(
        off_chain: OffChainTransport,
        chain_client: Arc<dyn ChainClient>,
        priv_validator: Arc<dyn PrivValidator>,
        events: Arc<EventHub>,
        codec: Codec,
    ) -> Arc<Self> {
        let (block_notify_tx, block_notify_rx) = channel::new_bounded_mixed(1);

        Arc::new(Self {
            off_chain,
            chain_client,
            on_chain: Mutex::new(None),
            on_chain_round: Mutex::new(RoundId::ZERO),
            is_on_chain: RwLock::new(false),
            block_notify_tx,
            block_notify_rx,
            priv_validator,
            codec,
            events,
            on_chain_factory: PolyKeyGeneratorFactory::arced(),
        })
    }

    /// Swaps the key generator factory used by fallback rounds.
    pub fn with_on_chain_factory(
        self: Arc<Self>,
        factory: Arc<dyn KeyGeneratorFactory>,
    ) -> Arc<Self> {
        // The orchestrator is still exclusively owned at builder time.
        let mut this = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("builder must be unique"));
        this.on_chain_factory = factory;
        Arc::new(this)
    }

    pub fn off_chain(&self) -> &OffChainTransport {
        &self.off_chain
    }

    pub fn is_on_chain(&self) -> bool {
        *self.is_on_chain.read().expect("orchestrator lock poisoned")
    }

    /// Feeds one inbound share; flips to the on-chain transport when the
    /// off-chain engine reports corruption.
    pub fn handle_share(&self, msg: &DkgMessage, height: Height, validators: &ValidatorSet) {
        if self.is_on_chain() {
            debug!("dkg: ignoring off-chain share while on-chain fallback is active");
            return;
        }

        if self.off_chain.handle_share(msg, height, validators) {
            info!("dkg: off-chain round corrupt, falling back to on-chain");

            if let Err(err) = self.switch_to_on_chain(validators) {
                error!("dkg: failed to engage on-chain fallback: {:?}", err);
                *self.is_on_chain.write().expect("orchestrator lock poisoned") = false;
            }
        }
    }

    /// Called once per block by the host.
    pub fn check_dkg_time(&self, height: Height, validators: &ValidatorSet) {
        self.off_chain.check_dkg_time(height, validators);

        if self.is_on_chain() {
            self.new_block_notify(height);
        }
    }

    /// Wakes the block-watch worker; the channel is one deep, so a
    /// pending notification swallows newer ones.
    pub fn new_block_notify(&self, height: Height) {
        let _ = self.block_notify_tx.try_send_return(height);
    }

    pub fn verifier(&self) -> Option<Arc<crate::crypto::threshold::BlsVerifier>> {
        self.off_chain.manager().verifier()
    }

    pub fn msg_queue(&self) -> ChannelMixedRx<DkgMessage> {
        self.off_chain.msg_queue()
    }

    pub fn pop_losers(&self) -> Vec<Loser> {
        if self.is_on_chain() {
            let guard = self.on_chain.lock().expect("orchestrator lock poisoned");

            if let Some(on_chain) = guard.as_ref() {
                return on_chain.pop_losers();
            }
        }

        self.off_chain.manager().pop_losers()
    }

    fn switch_to_on_chain(&self, validators: &ValidatorSet) -> Result<()> {
        {
            let mut flag = self.is_on_chain.write().expect("orchestrator lock poisoned");
            if *flag {
                return Ok(());
            }
            *flag = true;
        }

        let on_chain = {
            let mut guard = self.on_chain.lock().expect("orchestrator lock poisoned");

            guard
                .get_or_insert_with(|| {
                    Arc::new(
                        OnChainTransport::new(
                            self.chain_client.clone(),
                            self.events.clone(),
                            self.priv_validator.clone(),
                            self.codec,
                        )
                        .with_key_generator_factory(self.on_chain_factory.clone()),
                    )
                })
                .clone()
        };

        // The corrupted round id is burnt; the chain gets the next one.
        let round_id = self.off_chain.manager().bump_round_id();
        *self.on_chain_round.lock().expect("orchestrator lock poisoned") = round_id;

        on_chain.start_round(validators, round_id)
    }

    /// One iteration of the fallback loop: pulls the current block's
    /// messages and, when the round completes, installs the verifier
    /// back into the off-chain engine and leaves fallback mode.
    ///
    /// Returns `true` when fallback mode ended (success or hard error).
    pub fn on_chain_tick(&self, height: Height) -> Result<bool> {
        if !self.is_on_chain() {
            return Ok(true);
        }

        let on_chain = {
            let guard = self.on_chain.lock().expect("orchestrator lock poisoned");
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("fallback engaged without a transport"))?
        };

        let round_id = *self.on_chain_round.lock().expect("orchestrator lock poisoned");

        match on_chain.process_block(round_id) {
            Ok(false) => Ok(false),
            Ok(true) => {
                let verifier = on_chain.verifier()?;

                let manager = self.off_chain.manager();
                let change_height = (height + manager.config().blocks_ahead())
                    .quantize_down(manager.config().quantization());

                info!(%change_height, "dkg: on-chain fallback produced a verifier");

                manager.install_next_verifier(Arc::new(verifier), change_height);
                *self.is_on_chain.write().expect("orchestrator lock poisoned") = false;

                Ok(true)
            }
            Err(err) => {
                error!("dkg: on-chain fallback round failed: {:?}", err);
                *self.is_on_chain.write().expect("orchestrator lock poisoned") = false;

                Err(err)
            }
        }
    }

    /// Spawns the long-running block-watch worker. Call once at startup,
    /// after the async runtime is initialized.
    pub fn spawn_block_watcher(self: &Arc<Self>) {
        let this = self.clone();
        let mut notify = self.block_notify_rx.clone();

        async_runtime::spawn(async move {
            loop {
                let height = match notify.recv_async().await {
                    Ok(height) => height,
                    Err(_) => break,
                };

                match this.on_chain_tick(height) {
                    Ok(_) => {}
                    Err(err) => {
                        error!("dkg: block watcher stopping a failed round: {:?}", err);
                    }
                }
            }
        });
    }
}
