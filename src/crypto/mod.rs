//! Cryptographic primitives consumed by the engine: consensus-key
//! signatures over wire messages and the threshold scheme behind the
//! distributed key generation itself.

pub mod signature;
pub mod threshold;
