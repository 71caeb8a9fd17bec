//! Engine configuration.

use getset::CopyGetters;

use crate::messages::MessageKind;

/// How often a node starts a fresh key generation round, in blocks.
pub const DEFAULT_NUM_BLOCKS: i64 = 100;

/// Agree to swap the verifier after around this number of blocks.
pub const DEFAULT_BLOCKS_AHEAD: i64 = 20;

/// Change heights are rounded down to a multiple of this, so all nodes
/// promote at the same height without further coordination.
pub const DEFAULT_QUANTIZATION: i64 = 5;

/// Capacity of the local DKG message queue.
pub const DEFAULT_MSG_QUEUE_SIZE: usize = 1000;

/// Tunables of the key generation engine.
///
/// All values have working defaults; the `with_*` constructors mirror the
/// optional-parameter style of the host's configuration layer.
#[derive(Debug, Copy, Clone, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct DkgConfig {
    num_blocks: i64,
    blocks_ahead: i64,
    quantization: i64,
    msg_queue_size: usize,
}

impl Default for DkgConfig {
    fn default() -> Self {
        Self {
            num_blocks: DEFAULT_NUM_BLOCKS,
            blocks_ahead: DEFAULT_BLOCKS_AHEAD,
            quantization: DEFAULT_QUANTIZATION,
            msg_queue_size: DEFAULT_MSG_QUEUE_SIZE,
        }
    }
}

impl DkgConfig {
    /// Sets the round auto-start cadence. A zero value falls back to the
    /// default rather than disabling the cadence.
    pub fn with_num_blocks(mut self, num_blocks: i64) -> Self {
        self.num_blocks = if num_blocks == 0 {
            DEFAULT_NUM_BLOCKS
        } else {
            num_blocks
        };
        self
    }

    pub fn with_blocks_ahead(mut self, blocks_ahead: i64) -> Self {
        self.blocks_ahead = blocks_ahead;
        self
    }

    pub fn with_quantization(mut self, quantization: i64) -> Self {
        self.quantization = quantization;
        self
    }

    pub fn with_msg_queue_size(mut self, msg_queue_size: usize) -> Self {
        self.msg_queue_size = msg_queue_size;
        self
    }
}

/// The number of messages of a given kind a single peer may contribute to
/// one round. Anything past the cap is dropped by the per-phase store.
///
/// Each peer announces one public key and one commit bundle, answers every
/// deal it receives with a response, and rebuts every response it sees with
/// a justification (most of them empty placeholders).
pub fn max_messages_per_peer(kind: MessageKind, validators: usize) -> usize {
    let n = validators;

    match kind {
        MessageKind::PubKey => 1,
        MessageKind::Deal => 1,
        MessageKind::Response => n.saturating_sub(1),
        MessageKind::Justification => n.saturating_sub(1) * n.saturating_sub(1),
        MessageKind::Commits => 1,
        MessageKind::Complaint => 1,
        MessageKind::ReconstructCommit => 1,
    }
}
