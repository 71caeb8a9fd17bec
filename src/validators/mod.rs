//! The validator-set snapshot the engine runs against, and the signing
//! capability of the local validator.
//!
//! Validator-set management belongs to the consensus host; the engine
//! only ever receives immutable snapshots of it at round start.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::crypto::signature::{KeyPair, PublicKey, Signature, ValidatorAddress};
use crate::error::*;

/// One committee member: its address and consensus public key.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Validator {
    address: ValidatorAddress,
    pub_key: PublicKey,
}

impl Validator {
    pub fn new(pub_key: PublicKey) -> Self {
        Self {
            address: pub_key.address(),
            pub_key,
        }
    }

    pub fn address(&self) -> ValidatorAddress {
        self.address
    }

    pub fn pub_key(&self) -> &PublicKey {
        &self.pub_key
    }
}

/// An immutable snapshot of the committee for one round.
///
/// Kept sorted by address so every node derives identical participant
/// ordering from identical membership.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address().cmp(&b.address()));

        Self { validators }
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn get_by_address(&self, address: &ValidatorAddress) -> Option<&Validator> {
        self.validators
            .iter()
            .find(|validator| validator.address() == *address)
    }

    pub fn contains(&self, address: &ValidatorAddress) -> bool {
        self.get_by_address(address).is_some()
    }
}

/// The signing capability of this node's consensus identity.
///
/// The key may be shared with the consensus engine proper, so every
/// implementation must be safe to call concurrently.
pub trait PrivValidator: Send + Sync {
    fn address(&self) -> ValidatorAddress;

    fn public_key(&self) -> PublicKey;

    /// Signs the given sign-bytes with the consensus key.
    fn sign_bytes(&self, bytes: &[u8]) -> Result<Signature>;
}

/// A [`PrivValidator`] holding the consensus key in process memory.
pub struct LocalPrivValidator {
    key: Mutex<KeyPair>,
    pub_key: PublicKey,
    address: ValidatorAddress,
}

impl LocalPrivValidator {
    pub fn new(key: KeyPair) -> Self {
        let pub_key = key.public_key();
        let address = pub_key.address();

        Self {
            key: Mutex::new(key),
            pub_key,
            address,
        }
    }

    pub fn generate() -> Result<Self> {
        KeyPair::generate_key_pair().map(Self::new)
    }
}

impl PrivValidator for LocalPrivValidator {
    fn address(&self) -> ValidatorAddress {
        self.address
    }

    fn public_key(&self) -> PublicKey {
        self.pub_key
    }

    fn sign_bytes(&self, bytes: &[u8]) -> Result<Signature> {
        let key = self
            .key
            .lock()
            .map_err(|_| anyhow::anyhow!("priv validator lock poisoned"))?;

        key.sign(bytes)
    }
}
