//! `beacon-dkg` lets a committee of validators jointly produce a
//! threshold BLS key without any single party ever holding the master
//! secret. Each finished round leaves every validator with a share that
//! signs randomness beacons; any threshold of partial signatures
//! combines into a signature the master public key accepts.
//!
//! # Feature flags
//!
//! Backend choices follow the usual flag-per-alternative scheme:
//!
//! - The asynchronous runtime running the transport workers:
//!     + E.g. to use `tokio`, enter the feature flag `async_runtime_tokio`.
//! - The channel implementations moving messages between tasks:
//!     + E.g. `channel_sync_crossbeam`, `channel_mixed_flume`.
//! - The crypto library signing the wire messages:
//!     + E.g. `crypto_signature_ring_ed25519`.
//!
//! The default flags are a working configuration; the threshold
//! arithmetic itself is not switchable and always comes from
//! `threshold_crypto`.

use tracing::debug;

use crate::error::*;
use crate::globals::Flag;

pub mod async_runtime;
pub mod channel;
pub mod circuit_breaker;
pub mod config;
pub mod crypto;
pub mod dealer;
pub mod error;
pub mod events;
pub mod globals;
pub mod messages;
pub mod orchestrator;
pub mod ordering;
pub mod round;
pub mod transport;
pub mod validators;

static INITIALIZED: Flag = Flag::new();

/// Configure the init process of the library.
pub struct InitConfig {
    /// Number of threads used by the async runtime.
    pub async_threads: usize,
}

/// Handle to the global data.
///
/// When dropped, the data is deinitialized.
#[repr(transparent)]
pub struct InitGuard;

/// Initializes global data.
///
/// Should always be called before other methods, otherwise runtime
/// panics may ensue.
///
/// # Safety
/// Safe when called once, before anything else in the library.
pub unsafe fn init(c: InitConfig) -> Result<Option<InitGuard>> {
    if INITIALIZED.test() {
        return Ok(None);
    }

    async_runtime::init(c.async_threads)?;

    debug!("Async threads {}", c.async_threads);

    INITIALIZED.set();
    Ok(Some(InitGuard))
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        unsafe { drop().unwrap() }
    }
}

unsafe fn drop() -> Result<()> {
    INITIALIZED.unset();
    async_runtime::drop()?;
    Ok(())
}
