//! Public key cryptographic operations.
//!
//! Every DKG wire message is signed with the validator's consensus key;
//! the 20 byte validator address is derived from the same key.

use std::cmp;
use std::fmt::{Debug, Display, Formatter};

use serde::de::{Error, SeqAccess};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::error::*;

#[cfg(feature = "crypto_signature_ring_ed25519")]
mod ring_ed25519;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("Failed to generate key {0:?}")]
    GenerateKey(String),
    #[error("Invalid signature {0:?}")]
    InvalidSignature(String),
    #[error("Invalid private key {0:?}")]
    InvalidPK(String),
    #[error("Invalid public key, length is wrong {0}")]
    PublicKeyLen(usize),
    #[error("Invalid signature, length is wrong {0}")]
    SignatureLen(usize),
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Failed to verify signature {0:?}, signature is {1:x?}")]
    VerificationError(String, Vec<u8>),
    #[error("Invalid signature, cannot be blank")]
    BlankSignature,
    #[error("Invalid signature, length is wrong {0}")]
    SignatureLen(usize),
}

/// The address of a validator, derived from its consensus public key.
///
/// This is the identity every protocol message carries and the only value
/// participants are sorted by, so it has a single canonical form: the raw
/// 20 bytes. Hex only ever appears in log output.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ValidatorAddress([u8; Self::LENGTH]);

impl ValidatorAddress {
    pub const LENGTH: usize = 20;

    pub fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        ValidatorAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

impl AsRef<[u8]> for ValidatorAddress {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for ValidatorAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for ValidatorAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValidatorAddress({})", self)
    }
}

/// A `KeyPair` holds both the private and public key components
/// that form a validator's consensus identity.
pub struct KeyPair {
    #[cfg(feature = "crypto_signature_ring_ed25519")]
    inner: ring_ed25519::KeyPair,

    pub_key_bytes: Vec<u8>,
}

/// The public component of a `KeyPair`.
#[derive(Copy, Clone)]
pub struct PublicKey {
    #[cfg(feature = "crypto_signature_ring_ed25519")]
    inner: ring_ed25519::PublicKey,
}

/// A `Signature` is the result of using `KeyPair::sign`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Signature {
    #[cfg(feature = "crypto_signature_ring_ed25519")]
    inner: ring_ed25519::Signature,
}

impl KeyPair {
    pub fn generate_key_pair() -> Result<Self> {
        let (inner, public_key) = {
            #[cfg(feature = "crypto_signature_ring_ed25519")]
            {
                ring_ed25519::KeyPair::generate()?
            }
        };

        Ok(KeyPair {
            inner,
            pub_key_bytes: public_key,
        })
    }

    pub fn from_pkcs8(bytes: &[u8]) -> Result<Self> {
        let (inner, public_key) = {
            #[cfg(feature = "crypto_signature_ring_ed25519")]
            {
                ring_ed25519::KeyPair::from_pkcs8(bytes)?
            }
        };

        Ok(KeyPair {
            inner,
            pub_key_bytes: public_key,
        })
    }

    /// Constructs a `KeyPair` from a raw seed of appropriate size.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        let (inner, pk_bytes) = {
            #[cfg(feature = "crypto_signature_ring_ed25519")]
            {
                ring_ed25519::KeyPair::from_bytes(raw_bytes)?
            }
        };

        Ok(KeyPair {
            inner,
            pub_key_bytes: pk_bytes,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.public_key(),
        }
    }

    /// Returns a reference to the public key bytes of this `KeyPair`.
    /// This is used mostly for serialization stuff
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.pub_key_bytes
    }

    /// The validator address bound to this key pair.
    pub fn address(&self) -> ValidatorAddress {
        self.public_key().address()
    }

    /// Performs a cryptographic signature of an arbitrary message.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let inner = self.inner.sign(message)?;
        Ok(Signature { inner })
    }
}

impl PublicKey {
    /// Constructs a `PublicKey` from a byte buffer of appropriate size.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        let inner = {
            #[cfg(feature = "crypto_signature_ring_ed25519")]
            {
                ring_ed25519::PublicKey::from_bytes(raw_bytes)?
            }
        };

        Ok(PublicKey { inner })
    }

    pub fn pk_bytes(&self) -> &[u8] {
        self.inner.as_ref()
    }

    /// Derives the validator address: the first 20 bytes of the hash of
    /// the public key.
    pub fn address(&self) -> ValidatorAddress {
        let digest = blake3::hash(self.inner.as_ref());

        let mut addr = [0u8; ValidatorAddress::LENGTH];
        addr.copy_from_slice(&digest.as_bytes()[..ValidatorAddress::LENGTH]);

        ValidatorAddress(addr)
    }

    /// Verifies if a signature is valid, i.e. if this key pair performed it.
    pub fn verify(
        &self,
        message: &[u8],
        signature: &Signature,
    ) -> std::result::Result<(), VerifyError> {
        self.inner.verify(message, &signature.inner)
    }
}

impl Signature {
    /// Length in bytes required to represent a `Signature` in memory.
    pub const LENGTH: usize = {
        #[cfg(feature = "crypto_signature_ring_ed25519")]
        {
            ring_ed25519::Signature::LENGTH
        }
    };

    /// Constructs a `Signature` from a byte buffer of appropriate size.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        let inner = {
            #[cfg(feature = "crypto_signature_ring_ed25519")]
            {
                ring_ed25519::Signature::from_bytes(raw_bytes)?
            }
        };
        Ok(Signature { inner })
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x?}", self.inner.as_ref().chunks(4).next().unwrap())
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_ref()
    }
}

struct ByteBufVisitor;

impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a byte array")
    }

    fn visit_seq<V>(self, mut visitor: V) -> std::result::Result<Vec<u8>, V::Error>
    where
        V: SeqAccess<'de>,
    {
        let len = cmp::min(visitor.size_hint().unwrap_or(0), 4096);
        let mut bytes = Vec::with_capacity(len);

        while let Some(b) = visitor.next_element()? {
            bytes.push(b);
        }

        Ok(bytes)
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Vec<u8>, E>
    where
        E: Error,
    {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Vec<u8>, E>
    where
        E: Error,
    {
        Ok(v)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.pk_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let vec = deserializer.deserialize_bytes(ByteBufVisitor)?;

        match Self::from_bytes(vec.as_slice()) {
            Ok(pk) => Ok(pk),
            Err(err) => Err(serde::de::Error::custom(err)),
        }
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let vec = deserializer.deserialize_bytes(ByteBufVisitor)?;

        match Self::from_bytes(vec.as_slice()) {
            Ok(sig) => Ok(sig),
            Err(err) => Err(serde::de::Error::custom(err)),
        }
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x?}", self.pk_bytes().chunks(4).next().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_through_bytes() {
        let pair = KeyPair::generate_key_pair().unwrap();

        let signature = pair.sign(b"beacon").unwrap();
        let restored = Signature::from_bytes(signature.as_ref()).unwrap();

        pair.public_key().verify(b"beacon", &restored).unwrap();
    }

    #[test]
    fn addresses_are_stable_per_key() {
        let pair = KeyPair::generate_key_pair().unwrap();

        assert_eq!(pair.address(), pair.public_key().address());

        let other = KeyPair::generate_key_pair().unwrap();
        assert_ne!(pair.address(), other.address());
    }

    #[test]
    fn tampered_messages_fail_verification() {
        let pair = KeyPair::generate_key_pair().unwrap();
        let signature = pair.sign(b"beacon").unwrap();

        assert!(pair.public_key().verify(b"not the beacon", &signature).is_err());
    }
}
