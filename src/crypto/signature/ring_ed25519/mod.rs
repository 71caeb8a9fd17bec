use ring::rand::SystemRandom;
use ring::signature::{self as rsig, Ed25519KeyPair, KeyPair as _};

use crate::crypto::signature::{SignError, VerifyError};
use crate::error::*;
use crate::Err;

pub struct KeyPair {
    inner: Ed25519KeyPair,
}

#[derive(Copy, Clone)]
pub struct PublicKey {
    bytes: [u8; Self::LENGTH],
}

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Signature {
    bytes: [u8; Self::LENGTH],
}

impl KeyPair {
    pub fn generate() -> Result<(Self, Vec<u8>)> {
        let rng = SystemRandom::new();

        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|err| SignError::GenerateKey(format!("{:?}", err)))?;

        Self::from_pkcs8(document.as_ref())
    }

    pub fn from_pkcs8(bytes: &[u8]) -> Result<(Self, Vec<u8>)> {
        let inner = Ed25519KeyPair::from_pkcs8(bytes)
            .map_err(|err| SignError::InvalidPK(format!("{:?}", err)))?;

        let pk_bytes = inner.public_key().as_ref().to_vec();

        Ok((KeyPair { inner }, pk_bytes))
    }

    /// Builds a key pair from a raw 32 byte ed25519 seed.
    pub fn from_bytes(seed: &[u8]) -> Result<(Self, Vec<u8>)> {
        let inner = Ed25519KeyPair::from_seed_unchecked(seed)
            .map_err(|err| SignError::InvalidPK(format!("{:?}", err)))?;

        let pk_bytes = inner.public_key().as_ref().to_vec();

        Ok((KeyPair { inner }, pk_bytes))
    }

    pub fn public_key(&self) -> PublicKey {
        let mut bytes = [0u8; PublicKey::LENGTH];
        bytes.copy_from_slice(self.inner.public_key().as_ref());

        PublicKey { bytes }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signed = self.inner.sign(message);

        Signature::from_bytes(signed.as_ref())
    }
}

impl PublicKey {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err!(SignError::PublicKeyLen(raw_bytes.len()));
        }

        let mut bytes = [0u8; Self::LENGTH];
        bytes.copy_from_slice(raw_bytes);

        Ok(PublicKey { bytes })
    }

    pub fn verify(
        &self,
        message: &[u8],
        signature: &Signature,
    ) -> std::result::Result<(), VerifyError> {
        let key = rsig::UnparsedPublicKey::new(&rsig::ED25519, &self.bytes[..]);

        key.verify(message, signature.as_ref()).map_err(|_| {
            VerifyError::VerificationError(
                "ed25519 verification failed".to_string(),
                signature.as_ref().to_vec(),
            )
        })
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Signature {
    pub const LENGTH: usize = 64;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err!(SignError::SignatureLen(raw_bytes.len()));
        }

        let mut bytes = [0u8; Self::LENGTH];
        bytes.copy_from_slice(raw_bytes);

        Ok(Signature { bytes })
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}
