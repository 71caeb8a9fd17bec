//! Error handling for the DKG engine.
//!
//! Modules declare their own `thiserror` enums and surface them through the
//! crate-wide [`Result`], which is backed by `anyhow` so errors compose
//! across module boundaries without a giant crate-level enum. The `Err!`
//! macro wraps a typed error into the anyhow envelope at the return site.

pub type Result<T> = anyhow::Result<T>;

/// Wraps a typed error value into the crate [`Result`] error envelope.
#[macro_export]
macro_rules! Err {
    ($e:expr) => {
        Err(anyhow::Error::new($e))
    };
}
