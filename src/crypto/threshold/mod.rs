//! Threshold cryptography behind the key generation protocol.
//!
//! The engine only ever talks to this seam: [`KeyGenerator`] is the
//! per-round distributed key generation instance (one per dealer), and
//! [`BlsVerifier`] is the terminal object a finished round yields. The
//! pairing arithmetic itself lives in the `threshold_crypto` crate; the
//! payload types here are what travels inside the opaque `payload` bytes
//! of the wire messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use threshold_crypto::poly::{BivarCommitment, Commitment, Poly};
use threshold_crypto::{Fr, PublicKey as GroupPoint, SecretKey};

use crate::error::*;
use crate::Err;

mod bls;
pub mod keygen;

pub use bls::{BlsShare, BlsVerifier, CombinedSignature, PartialSignature};
pub use keygen::{PolyKeyGenerator, PolyKeyGeneratorFactory};

/// Serde bridge for a single field element, in terms of the crate's
/// `FieldWrap` helper.
pub(crate) mod field_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use threshold_crypto::serde_impl::FieldWrap;
    use threshold_crypto::Fr;

    pub fn serialize<S: Serializer>(field: &Fr, s: S) -> std::result::Result<S::Ok, S::Error> {
        FieldWrap(field).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Fr, D::Error> {
        FieldWrap::deserialize(d).map(FieldWrap::into_inner)
    }
}

/// Serde bridge for a vector of field elements, in terms of the crate's
/// `FieldWrap` helper (mirrors the crate's own private `serde_impl::field_vec`,
/// which is not reachable outside the crate).
pub(crate) mod field_vec_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use threshold_crypto::serde_impl::FieldWrap;
    use threshold_crypto::Fr;

    pub fn serialize<S: Serializer>(vec: &[Fr], s: S) -> std::result::Result<S::Ok, S::Error> {
        let wrap_vec: Vec<FieldWrap<&Fr>> = vec.iter().map(FieldWrap).collect();
        wrap_vec.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Vec<Fr>, D::Error> {
        let wrap_vec = <Vec<FieldWrap<Fr>>>::deserialize(d)?;
        Ok(wrap_vec.into_iter().map(FieldWrap::into_inner).collect())
    }
}

#[derive(Error, Debug)]
pub enum KeyGenError {
    #[error("Not enough participants for a threshold of {1}: {0}")]
    NotEnoughParticipants(usize, usize),
    #[error("Our own public key is not among the participants")]
    OwnKeyMissing,
    #[error("Deal references dealer {0}, which is not a participant")]
    UnknownDealer(u64),
    #[error("We have already processed a deal from dealer {0}")]
    DuplicateDeal(u64),
    #[error("The row in the deal from dealer {0} does not match its commitment")]
    WrongCommitment(u64),
    #[error("Response from verifier {verifier} about dealer {dealer} carries a bad value")]
    InvalidAck { dealer: u64, verifier: u64 },
    #[error("Justification from dealer {0} does not rebut the rejection")]
    InvalidJustification(u64),
    #[error("The generator is not certified yet")]
    NotCertified,
    #[error("The generator has not finished the commit phase")]
    NotFinished,
    #[error("Failed to combine signature shares: {0}")]
    CombineFailure(String),
    #[error("Signature share from participant {0} failed verification")]
    BadSignatureShare(usize),
}

/// The `n`-of-`t` shape of one key generation run.
///
/// `t` is the degree of the shared polynomial: `t + 1` partial signatures
/// reconstruct a full one, and up to `t` revealed shares leak nothing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ThresholdParams {
    n: usize,
    t: usize,
}

impl ThresholdParams {
    pub fn new(n: usize, t: usize) -> Result<Self> {
        if t >= n {
            return Err!(KeyGenError::NotEnoughParticipants(n, t));
        }

        Ok(ThresholdParams { n, t })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn t(&self) -> usize {
        self.t
    }
}

/// A fresh per-round secret scalar.
pub struct Scalar(pub(crate) SecretKey);

/// A pairing-group point; the per-round public key of one participant.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Point(pub(crate) GroupPoint);

impl Scalar {
    /// Samples a fresh random scalar for this round.
    pub fn pick() -> Scalar {
        Scalar(SecretKey::random())
    }

    /// The public point `g * self`.
    pub fn public_point(&self) -> Point {
        Point(self.0.public_key())
    }
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Point({:?})", self.0)
    }
}

/// One dealer's contribution for a single recipient: the dealer's public
/// polynomial commitment plus the recipient's verified row of it.
#[derive(Serialize, Deserialize, Clone)]
pub struct Deal {
    pub(crate) dealer: u64,
    pub(crate) commitment: BivarCommitment,
    pub(crate) row: Poly,
}

impl Deal {
    pub fn dealer(&self) -> u64 {
        self.dealer
    }

    /// The commitment to the dealer's master-polynomial contribution,
    /// used by the on-chain variant to cross-check pre-published commits.
    pub fn row_zero_commitment(&self) -> Commitment {
        self.commitment.row(0)
    }

    /// Number of commitment coefficients carried by this deal.
    pub fn commitment_len(&self) -> usize {
        self.commitment.degree() + 1
    }
}

/// A verifier's accept/reject of a dealer's deal, carrying the evaluated
/// check values every other participant can verify against the dealer's
/// commitment.
#[derive(Serialize, Deserialize, Clone)]
pub struct Response {
    pub(crate) dealer: u64,
    pub(crate) verifier: u64,
    pub(crate) approved: bool,
    #[serde(with = "field_vec_serde")]
    pub(crate) values: Vec<Fr>,
}

impl Response {
    pub fn dealer(&self) -> u64 {
        self.dealer
    }

    pub fn verifier(&self) -> u64 {
        self.verifier
    }

    pub fn approved(&self) -> bool {
        self.approved
    }
}

/// A dealer's rebuttal of a rejection: the disputed row, in the open.
#[derive(Serialize, Deserialize, Clone)]
pub struct Justification {
    pub(crate) dealer: u64,
    pub(crate) verifier: u64,
    pub(crate) row: Poly,
}

impl Justification {
    pub fn dealer(&self) -> u64 {
        self.dealer
    }
}

/// The dealer's phase-II commitment to its share of the master public
/// polynomial.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SecretCommits {
    pub(crate) dealer: u64,
    pub(crate) commitment: Commitment,
}

impl SecretCommits {
    pub fn dealer(&self) -> u64 {
        self.dealer
    }

    pub fn commitment(&self) -> &Commitment {
        &self.commitment
    }

    /// Number of commitment coefficients; the wire layer carries this as
    /// a decode hint.
    pub fn commitment_len(&self) -> usize {
        self.commitment.degree() + 1
    }
}

/// Evidence that a dealer equivocated between phase I and phase II: the
/// deal the complainer received, which contradicts the published commits.
#[derive(Serialize, Deserialize, Clone)]
pub struct ComplaintCommits {
    pub(crate) dealer: u64,
    pub(crate) verifier: u64,
    pub(crate) deal: Deal,
}

impl ComplaintCommits {
    pub fn dealer(&self) -> u64 {
        self.dealer
    }

    /// Number of commitment coefficients inside the embedded deal.
    pub fn commitment_len(&self) -> usize {
        self.deal.commitment_len()
    }
}

/// One participant's revealed share of a disputed dealer's contribution,
/// published so everyone can reconstruct it.
#[derive(Serialize, Deserialize, Clone)]
pub struct ReconstructCommits {
    pub(crate) dealer: u64,
    pub(crate) verifier: u64,
    pub(crate) index: u64,
    #[serde(with = "field_serde")]
    pub(crate) value: Fr,
}

impl ReconstructCommits {
    pub fn dealer(&self) -> u64 {
        self.dealer
    }
}

/// The output of a finished generator: this participant's private share
/// and the master public polynomial.
pub struct DistKeyShare {
    pub(crate) public_key_set: threshold_crypto::PublicKeySet,
    pub(crate) secret_share: threshold_crypto::SecretKeyShare,
    pub(crate) own_index: usize,
}

impl DistKeyShare {
    pub fn own_index(&self) -> usize {
        self.own_index
    }
}

/// A per-round distributed key generation instance.
///
/// One lives inside every dealer; the dealer feeds it decoded payloads in
/// protocol order and reads the readiness predicates off it. All methods
/// are pure CPU; nothing here suspends.
pub trait KeyGenerator: Send + Sync {
    /// Our position in the sorted participant list.
    fn own_index(&self) -> usize;

    /// Produces one deal per other participant, keyed by recipient index.
    fn deals(&mut self) -> Result<BTreeMap<usize, Deal>>;

    /// Verifies and stores a deal addressed to us, answering with the
    /// response to broadcast.
    fn process_deal(&mut self, deal: &Deal) -> Result<Response>;

    /// Feeds another verifier's response. Returns a justification when
    /// the response rejects a deal this instance dealt.
    fn process_response(&mut self, resp: &Response) -> Result<Option<Justification>>;

    /// Feeds a dealer's rebuttal of a rejection.
    fn process_justification(&mut self, justification: &Justification) -> Result<()>;

    /// Our commitment message, available from construction. The
    /// commits-first protocol variant publishes this before any deal.
    fn commits(&self) -> SecretCommits;

    /// True once enough dealers completed phase I to reconstruct a key.
    fn certified(&self) -> bool;

    /// The indices of dealers that survived phase I, ascending.
    fn qual(&self) -> Vec<usize>;

    /// Our phase-II commitment message.
    fn secret_commits(&self) -> Result<SecretCommits>;

    /// Verifies a dealer's phase-II commits against its phase-I
    /// commitment. Returns a complaint when they do not line up.
    fn process_secret_commits(&mut self, commits: &SecretCommits)
        -> Result<Option<ComplaintCommits>>;

    /// Verifies a complaint; when it holds, answers with our revealed
    /// share of the disputed contribution.
    fn process_complaint_commits(
        &mut self,
        complaint: &ComplaintCommits,
    ) -> Result<Option<ReconstructCommits>>;

    /// Collects revealed shares of a disputed contribution, rebuilding it
    /// once enough have arrived.
    fn process_reconstruct_commits(&mut self, reconstruct: &ReconstructCommits) -> Result<()>;

    /// True once every qualified dealer's commit phase is resolved.
    fn finished(&self) -> bool;

    /// The terminal share; only valid once [`Self::finished`] holds.
    fn dist_key_share(&self) -> Result<DistKeyShare>;
}

/// Constructs [`KeyGenerator`] instances for new rounds.
///
/// The engine takes this as an injection point so tests can script the
/// crypto while production uses [`PolyKeyGenerator`].
pub trait KeyGeneratorFactory: Send + Sync {
    /// `participants` is the sorted per-round public key list; `threshold`
    /// the degree of the shared polynomial.
    fn create(
        &self,
        sec_key: Scalar,
        participants: &[Point],
        threshold: usize,
    ) -> Result<Box<dyn KeyGenerator>>;
}
