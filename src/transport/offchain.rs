//! The direct peer-to-peer binding.

use std::sync::Arc;

use tracing::debug;

use crate::channel::ChannelMixedRx;
use crate::config::DkgConfig;
use crate::events::EventHub;
use crate::messages::{Codec, DkgMessage};
use crate::ordering::Height;
use crate::round::{RoundManager, ShareOutcome};
use crate::validators::ValidatorSet;

/// Runs the engine over the shared event bus.
///
/// Owns the round manager; inbound shares come from the bus subscription
/// and from the manager's own local queue, both pumped by the host.
pub struct OffChainTransport {
    manager: RoundManager,
}

impl OffChainTransport {
    pub fn new(manager: RoundManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &RoundManager {
        &self.manager
    }

    /// Feeds one inbound share to the engine.
    ///
    /// Returns `true` when the engine should fall back to the on-chain
    /// transport: a dealer reached the state where its verifier should
    /// exist, but producing it failed — the off-chain message set was
    /// corrupt (lost messages or a byzantine sender).
    pub fn handle_share(
        &self,
        msg: &DkgMessage,
        height: Height,
        validators: &ValidatorSet,
    ) -> bool {
        match self.manager.handle_share(msg, height, validators) {
            ShareOutcome::VerifierFailed => true,
            outcome => {
                debug!(?outcome, "dkg: handled off-chain share");
                false
            }
        }
    }

    pub fn check_dkg_time(&self, height: Height, validators: &ValidatorSet) {
        self.manager.check_dkg_time(height, validators);
    }

    pub fn start_round(&self, validators: &ValidatorSet) -> crate::error::Result<()> {
        self.manager.start_round(validators)
    }

    /// This node's own signed messages, to be fed back through
    /// [`Self::handle_share`].
    pub fn msg_queue(&self) -> ChannelMixedRx<DkgMessage> {
        self.manager.msg_queue()
    }

    pub fn config(&self) -> &DkgConfig {
        self.manager.config()
    }
}

/// Convenience constructor wiring a manager from its parts.
pub fn off_chain_transport(
    events: Arc<EventHub>,
    config: DkgConfig,
    priv_validator: Arc<dyn crate::validators::PrivValidator>,
    codec: Codec,
) -> OffChainTransport {
    OffChainTransport::new(RoundManager::new(events, config, priv_validator, codec))
}
