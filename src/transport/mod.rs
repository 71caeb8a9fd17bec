//! The two transport bindings the engine can run on.
//!
//! Off-chain, peers exchange signed messages directly over the event
//! bus. On-chain, every message is wrapped in a transaction and read
//! back from chain state once per block. The protocol core runs
//! identically on either; the off-chain binding additionally reports
//! when the engine should fall back to the chain.

use thiserror::Error;

use crate::error::*;
use crate::messages::{MessageKind, MsgSendDkgData};
use crate::ordering::RoundId;

mod offchain;
mod onchain;

pub use offchain::OffChainTransport;
pub use onchain::OnChainTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("chain query for {path} failed: {reason}")]
    QueryFailed { path: String, reason: String },
    #[error("broadcast of {count} transactions failed: {reason}")]
    BroadcastFailed { count: usize, reason: String },
}

/// The blockchain client the on-chain transport submits to and queries
/// from. The actual client library lives with the host; the engine only
/// sees this surface.
pub trait ChainClient: Send + Sync {
    /// Performs an ABCI-style query, returning the raw encoded result.
    fn query_with_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Submits a batch of DKG transactions with the given account
    /// sequence, in `sync` broadcast mode.
    fn broadcast_txs(&self, msgs: &[MsgSendDkgData], sequence: u64) -> Result<()>;
}

/// The query route for all messages of one kind in one round.
pub fn dkg_data_path(kind: MessageKind, round_id: RoundId) -> String {
    format!("custom/randapp/dkgData/{}/{}", kind.code(), round_id)
}
