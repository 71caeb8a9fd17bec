//! The terminal object of a successful round: a BLS threshold verifier.

use serde::{Deserialize, Serialize};
use threshold_crypto::{PublicKey, PublicKeySet, SecretKeyShare, Signature, SignatureShare};

use super::{DistKeyShare, KeyGenError, ThresholdParams};
use crate::error::*;
use crate::Err;

/// A partial BLS signature produced by one share holder.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct PartialSignature {
    sig: SignatureShare,
}

/// A full BLS signature recovered from a threshold of partials.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Eq, PartialEq, Debug)]
#[repr(transparent)]
pub struct CombinedSignature {
    sig: Signature,
}

/// This participant's slice of the distributed key.
#[derive(Debug)]
pub struct BlsShare {
    id: usize,
    secret: SecretKeyShare,
}

impl BlsShare {
    pub fn new(id: usize, secret: SecretKeyShare) -> Self {
        Self { id, secret }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

/// Signs and verifies beacon data against the master public polynomial of
/// one finished key generation round.
///
/// Any `t` distinct partial signatures over the same message recover a
/// signature the master public key accepts, no matter which `t` shares
/// contributed.
#[derive(Debug)]
pub struct BlsVerifier {
    master_pub_poly: PublicKeySet,
    share: BlsShare,
    t: usize,
    n: usize,
}

impl BlsVerifier {
    pub fn new(master_pub_poly: PublicKeySet, share: BlsShare, t: usize, n: usize) -> Self {
        Self {
            master_pub_poly,
            share,
            t,
            n,
        }
    }

    /// Builds a verifier straight from a finished generator's output.
    pub fn from_dist_key_share(share: DistKeyShare, t: usize, n: usize) -> Self {
        let DistKeyShare {
            public_key_set,
            secret_share,
            own_index,
        } = share;

        Self::new(public_key_set, BlsShare::new(own_index, secret_share), t, n)
    }

    pub fn params(&self) -> ThresholdParams {
        ThresholdParams {
            n: self.n,
            t: self.t,
        }
    }

    pub fn own_id(&self) -> usize {
        self.share.id
    }

    /// The master public key all recovered signatures verify against.
    pub fn master_public_key(&self) -> PublicKey {
        self.master_pub_poly.public_key()
    }

    /// Produces this node's partial signature over `data`.
    pub fn sign(&self, data: &[u8]) -> PartialSignature {
        PartialSignature {
            sig: self.share.secret.sign(data),
        }
    }

    /// Checks a partial signature from the share holder at `id`.
    pub fn verify_share(&self, id: usize, data: &[u8], sig: &PartialSignature) -> Result<()> {
        if self
            .master_pub_poly
            .public_key_share(id)
            .verify(&sig.sig, data)
        {
            Ok(())
        } else {
            Err!(KeyGenError::BadSignatureShare(id))
        }
    }

    /// Recovers the full signature from at least `t` partials.
    pub fn recover(
        &self,
        data: &[u8],
        partials: &[(usize, PartialSignature)],
    ) -> Result<CombinedSignature> {
        for (id, partial) in partials.iter().take(self.t) {
            self.verify_share(*id, data, partial)?;
        }

        let sig = self
            .master_pub_poly
            .combine_signatures(
                partials
                    .iter()
                    .take(self.t)
                    .map(|(id, partial)| (*id, &partial.sig)),
            )
            .map_err(|err| KeyGenError::CombineFailure(format!("{:?}", err)))?;

        Ok(CombinedSignature { sig })
    }

    /// Checks a recovered signature against the master public key.
    pub fn verify_combined(&self, data: &[u8], sig: &CombinedSignature) -> Result<()> {
        if self.master_pub_poly.public_key().verify(&sig.sig, data) {
            Ok(())
        } else {
            Err!(KeyGenError::CombineFailure(
                "combined signature does not verify".to_string()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use threshold_crypto::SecretKeySet;

    use super::*;

    const NODES: usize = 4;
    const THRESHOLD: usize = 2;

    fn verifiers_from_central_set() -> Vec<BlsVerifier> {
        let mut rng = rand::thread_rng();
        let sk_set = SecretKeySet::random(THRESHOLD, &mut rng);
        let pk_set = sk_set.public_keys();

        (0..NODES)
            .map(|id| {
                BlsVerifier::new(
                    pk_set.clone(),
                    BlsShare::new(id, sk_set.secret_key_share(id)),
                    THRESHOLD + 1,
                    NODES,
                )
            })
            .collect()
    }

    #[test]
    fn partials_from_any_quorum_recover_the_same_signature() {
        let verifiers = verifiers_from_central_set();
        let data = b"round 1 beacon";

        let partials: Vec<(usize, PartialSignature)> = verifiers
            .iter()
            .enumerate()
            .map(|(id, verifier)| (id, verifier.sign(data)))
            .collect();

        let from_first = verifiers[0].recover(data, &partials[..3]).unwrap();
        let from_last = verifiers[1].recover(data, &partials[1..]).unwrap();

        assert_eq!(from_first, from_last);
        verifiers[2].verify_combined(data, &from_first).unwrap();
    }

    #[test]
    fn foreign_partials_are_rejected() {
        let verifiers = verifiers_from_central_set();
        let data = b"round 1 beacon";

        let honest = verifiers[0].sign(data);

        // A share presented under the wrong id fails verification.
        assert!(verifiers[1].verify_share(1, data, &honest).is_err());
        verifiers[1].verify_share(0, data, &honest).unwrap();
    }
}
