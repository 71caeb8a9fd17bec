//! The production key generation instance, built from bivariate
//! polynomials over the pairing group.
//!
//! Every dealer samples a symmetric bivariate polynomial of degree `t`.
//! A deal hands a recipient its row together with the commitment to the
//! whole polynomial; responses publish evaluated check values of that row
//! so everyone can confirm the recipient was served honestly, and
//! justifications reveal a disputed row outright. The master public
//! polynomial is the sum of the zero rows of all qualified dealers, and a
//! participant's share is the sum of its row evaluations at zero.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::rngs::OsRng;
use threshold_crypto::ff::Field;
use threshold_crypto::group::CurveAffine;
use threshold_crypto::poly::{BivarCommitment, BivarPoly, Poly};
use threshold_crypto::{Fr, G1Affine, PublicKeySet};

use super::{
    Deal, DistKeyShare, Justification, KeyGenError, KeyGenerator, KeyGeneratorFactory, Point,
    ReconstructCommits, Response, Scalar, SecretCommits, ThresholdParams,
};
use crate::error::*;
use crate::Err;

/// Everything this instance knows about one dealer's contribution.
struct ProposalState {
    commitment: BivarCommitment,
    /// Our verified row of the dealer's polynomial, once a deal or a
    /// justification delivered it.
    row: Option<Poly>,
    /// Participants known to hold a verified share of this contribution.
    acks: BTreeSet<u64>,
    /// Whether the dealer's phase-II commits matched its phase-I
    /// commitment.
    commit_ok: bool,
    /// Shares revealed for a disputed contribution, keyed by the
    /// evaluation point they were taken at.
    disputed: BTreeMap<u64, Fr>,
    /// Our recovered value for a contribution that had to be rebuilt.
    reconstructed: Option<Fr>,
}

impl ProposalState {
    fn new(commitment: BivarCommitment) -> Self {
        Self {
            commitment,
            row: None,
            acks: BTreeSet::new(),
            commit_ok: false,
            disputed: BTreeMap::new(),
            reconstructed: None,
        }
    }

    fn complete(&self, n: usize) -> bool {
        self.acks.len() == n
    }

    fn resolved(&self) -> bool {
        self.commit_ok || self.reconstructed.is_some()
    }
}

pub struct PolyKeyGenerator {
    params: ThresholdParams,
    own_index: usize,
    own_poly: BivarPoly,
    proposals: BTreeMap<u64, ProposalState>,
    /// Phase-II commits as broadcast, kept to judge complaints.
    published_commits: BTreeMap<u64, threshold_crypto::poly::Commitment>,
}

impl PolyKeyGenerator {
    /// `participants` is the sorted per-round public key list; `sec_key`
    /// must be the scalar behind one of them. The scalar fixes our slot in
    /// the list; deals travel signed and directly addressed, so it plays
    /// no further part.
    pub fn new(sec_key: Scalar, participants: &[Point], threshold: usize) -> Result<Self> {
        let params = ThresholdParams::new(participants.len(), threshold)?;

        let own_point = sec_key.public_point();
        let own_index = participants
            .iter()
            .position(|point| *point == own_point)
            .ok_or(KeyGenError::OwnKeyMissing)?;

        let own_poly = BivarPoly::random(threshold, &mut OsRng);

        let mut own_state = ProposalState::new(own_poly.commitment());
        own_state.row = Some(own_poly.row(own_index + 1));
        own_state.acks.insert(own_index as u64);

        let mut proposals = BTreeMap::new();
        proposals.insert(own_index as u64, own_state);

        Ok(Self {
            params,
            own_index,
            own_poly,
            proposals,
            published_commits: BTreeMap::new(),
        })
    }

    fn n(&self) -> usize {
        self.params.n()
    }

    fn check_participant(&self, index: u64) -> Result<()> {
        if index as usize >= self.n() {
            return Err!(KeyGenError::UnknownDealer(index));
        }
        Ok(())
    }
}

impl KeyGenerator for PolyKeyGenerator {
    fn own_index(&self) -> usize {
        self.own_index
    }

    fn deals(&mut self) -> Result<BTreeMap<usize, Deal>> {
        let commitment = self.own_poly.commitment();

        let deals = (0..self.n())
            .filter(|recipient| *recipient != self.own_index)
            .map(|recipient| {
                let deal = Deal {
                    dealer: self.own_index as u64,
                    commitment: commitment.clone(),
                    row: self.own_poly.row(recipient + 1),
                };

                (recipient, deal)
            })
            .collect();

        Ok(deals)
    }

    fn process_deal(&mut self, deal: &Deal) -> Result<Response> {
        self.check_participant(deal.dealer)?;

        if self.proposals.contains_key(&deal.dealer) {
            return Err!(KeyGenError::DuplicateDeal(deal.dealer));
        }

        let own_math = self.own_index + 1;
        let valid = deal.row.commitment() == deal.commitment.row(own_math);

        let mut state = ProposalState::new(deal.commitment.clone());
        state.acks.insert(deal.dealer);

        let values = if valid {
            state.row = Some(deal.row.clone());
            state.acks.insert(self.own_index as u64);

            (0..self.n()).map(|m| deal.row.evaluate(m + 1)).collect()
        } else {
            Vec::new()
        };

        self.proposals.insert(deal.dealer, state);

        Ok(Response {
            dealer: deal.dealer,
            verifier: self.own_index as u64,
            approved: valid,
            values,
        })
    }

    fn process_response(&mut self, resp: &Response) -> Result<Option<Justification>> {
        self.check_participant(resp.dealer)?;
        self.check_participant(resp.verifier)?;

        if !resp.approved {
            // A rejection of our own deal gets a rebuttal; rejections of
            // other dealers are theirs to justify.
            if resp.dealer as usize == self.own_index {
                let row = self.own_poly.row(resp.verifier as usize + 1);

                return Ok(Some(Justification {
                    dealer: resp.dealer,
                    verifier: resp.verifier,
                    row,
                }));
            }

            return Ok(None);
        }

        let proposal = self
            .proposals
            .get_mut(&resp.dealer)
            .ok_or(KeyGenError::UnknownDealer(resp.dealer))?;

        let value = resp
            .values
            .get(self.own_index)
            .ok_or(KeyGenError::InvalidAck {
                dealer: resp.dealer,
                verifier: resp.verifier,
            })?;

        let expected = proposal
            .commitment
            .evaluate(self.own_index + 1, resp.verifier as usize + 1);

        if expected != G1Affine::one().mul(*value) {
            return Err!(KeyGenError::InvalidAck {
                dealer: resp.dealer,
                verifier: resp.verifier,
            });
        }

        proposal.acks.insert(resp.verifier);

        Ok(None)
    }

    fn process_justification(&mut self, justification: &Justification) -> Result<()> {
        self.check_participant(justification.dealer)?;
        self.check_participant(justification.verifier)?;

        let proposal = self
            .proposals
            .get_mut(&justification.dealer)
            .ok_or(KeyGenError::UnknownDealer(justification.dealer))?;

        let verifier_math = justification.verifier as usize + 1;

        if justification.row.commitment() != proposal.commitment.row(verifier_math) {
            return Err!(KeyGenError::InvalidJustification(justification.dealer));
        }

        if justification.verifier as usize == self.own_index && proposal.row.is_none() {
            proposal.row = Some(justification.row.clone());
        }

        proposal.acks.insert(justification.verifier);

        Ok(())
    }

    fn commits(&self) -> SecretCommits {
        SecretCommits {
            dealer: self.own_index as u64,
            commitment: self.own_poly.commitment().row(0),
        }
    }

    fn certified(&self) -> bool {
        self.qual().len() > self.params.t()
    }

    fn qual(&self) -> Vec<usize> {
        let n = self.n();

        self.proposals
            .iter()
            .filter(|(_, state)| state.complete(n))
            .map(|(dealer, _)| *dealer as usize)
            .collect()
    }

    fn secret_commits(&self) -> Result<SecretCommits> {
        if !self.certified() {
            return Err!(KeyGenError::NotCertified);
        }

        Ok(self.commits())
    }

    fn process_secret_commits(
        &mut self,
        commits: &SecretCommits,
    ) -> Result<Option<super::ComplaintCommits>> {
        self.check_participant(commits.dealer)?;

        let own_index = self.own_index as u64;

        let proposal = self
            .proposals
            .get_mut(&commits.dealer)
            .ok_or(KeyGenError::UnknownDealer(commits.dealer))?;

        self.published_commits
            .insert(commits.dealer, commits.commitment.clone());

        if commits.commitment == proposal.commitment.row(0) {
            proposal.commit_ok = true;
            return Ok(None);
        }

        // The dealer published commits that contradict the deal we were
        // served; attach that deal as evidence.
        let row = proposal
            .row
            .clone()
            .ok_or(KeyGenError::WrongCommitment(commits.dealer))?;

        Ok(Some(super::ComplaintCommits {
            dealer: commits.dealer,
            verifier: own_index,
            deal: Deal {
                dealer: commits.dealer,
                commitment: proposal.commitment.clone(),
                row,
            },
        }))
    }

    fn process_complaint_commits(
        &mut self,
        complaint: &super::ComplaintCommits,
    ) -> Result<Option<ReconstructCommits>> {
        self.check_participant(complaint.dealer)?;
        self.check_participant(complaint.verifier)?;

        let published = self
            .published_commits
            .get(&complaint.dealer)
            .ok_or(KeyGenError::UnknownDealer(complaint.dealer))?;

        let verifier_math = complaint.verifier as usize + 1;

        let deal_consistent = complaint.deal.row.commitment()
            == complaint.deal.commitment.row(verifier_math);
        let contradicts = complaint.deal.commitment.row(0) != *published;

        if !(deal_consistent && contradicts) {
            // Unfounded complaint; nothing to reveal.
            return Ok(None);
        }

        let proposal = self
            .proposals
            .get_mut(&complaint.dealer)
            .ok_or(KeyGenError::UnknownDealer(complaint.dealer))?;

        proposal.commit_ok = false;

        let own_math = self.own_index + 1;

        Ok(proposal.row.as_ref().map(|row| ReconstructCommits {
            dealer: complaint.dealer,
            verifier: self.own_index as u64,
            index: own_math as u64,
            value: row.evaluate(0),
        }))
    }

    fn process_reconstruct_commits(&mut self, reconstruct: &ReconstructCommits) -> Result<()> {
        self.check_participant(reconstruct.dealer)?;

        let threshold = self.params.t();
        let own_math = self.own_index + 1;

        let proposal = self
            .proposals
            .get_mut(&reconstruct.dealer)
            .ok_or(KeyGenError::UnknownDealer(reconstruct.dealer))?;

        if proposal.resolved() {
            return Ok(());
        }

        proposal
            .disputed
            .insert(reconstruct.index, reconstruct.value);

        if proposal.disputed.len() > threshold {
            let samples = proposal
                .disputed
                .iter()
                .take(threshold + 1)
                .map(|(index, value)| (*index as usize, value));

            let recovered = Poly::interpolate(samples);

            proposal.reconstructed = Some(recovered.evaluate(own_math));
        }

        Ok(())
    }

    fn finished(&self) -> bool {
        if !self.certified() {
            return false;
        }

        self.qual().into_iter().all(|dealer| {
            self.proposals
                .get(&(dealer as u64))
                .map(ProposalState::resolved)
                .unwrap_or(false)
        })
    }

    fn dist_key_share(&self) -> Result<DistKeyShare> {
        if !self.finished() {
            return Err!(KeyGenError::NotFinished);
        }

        let mut master = Poly::zero().commitment();
        let mut secret = Fr::zero();

        for dealer in self.qual() {
            let proposal = self
                .proposals
                .get(&(dealer as u64))
                .ok_or(KeyGenError::NotFinished)?;

            master += proposal.commitment.row(0);

            let value = match proposal.reconstructed {
                Some(value) => value,
                None => proposal
                    .row
                    .as_ref()
                    .ok_or(KeyGenError::NotFinished)?
                    .evaluate(0),
            };

            secret.add_assign(&value);
        }

        Ok(DistKeyShare {
            public_key_set: PublicKeySet::from(master),
            secret_share: threshold_crypto::SecretKeyShare::from_mut(&mut secret),
            own_index: self.own_index,
        })
    }
}

/// The factory the engine uses outside of tests.
pub struct PolyKeyGeneratorFactory;

impl PolyKeyGeneratorFactory {
    pub fn arced() -> Arc<dyn KeyGeneratorFactory> {
        Arc::new(PolyKeyGeneratorFactory)
    }
}

impl KeyGeneratorFactory for PolyKeyGeneratorFactory {
    fn create(
        &self,
        sec_key: Scalar,
        participants: &[Point],
        threshold: usize,
    ) -> Result<Box<dyn KeyGenerator>> {
        PolyKeyGenerator::new(sec_key, participants, threshold)
            .map(|generator| Box::new(generator) as Box<dyn KeyGenerator>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: usize = 4;
    const THRESHOLD: usize = 2;

    struct TestNode {
        generator: PolyKeyGenerator,
    }

    fn run_phase_one() -> Vec<TestNode> {
        let scalars: Vec<Scalar> = (0..NODES).map(|_| Scalar::pick()).collect();
        let points: Vec<Point> = scalars.iter().map(Scalar::public_point).collect();

        let mut nodes: Vec<TestNode> = scalars
            .into_iter()
            .map(|scalar| TestNode {
                generator: PolyKeyGenerator::new(scalar, &points, THRESHOLD).unwrap(),
            })
            .collect();

        // Deal distribution: every dealer serves every other node.
        let mut responses = Vec::new();
        for dealer in 0..NODES {
            let deals = nodes[dealer].generator.deals().unwrap();
            assert_eq!(deals.len(), NODES - 1);

            for (recipient, deal) in deals {
                let response = nodes[recipient].generator.process_deal(&deal).unwrap();
                assert!(response.approved());
                responses.push(response);
            }
        }

        // Every node sees every response not authored by itself.
        for node in 0..NODES {
            for response in &responses {
                if response.verifier() as usize == node {
                    continue;
                }

                let justification = nodes[node].generator.process_response(response).unwrap();
                assert!(justification.is_none());
            }
        }

        nodes
    }

    #[test]
    fn four_honest_nodes_certify() {
        let nodes = run_phase_one();

        for node in &nodes {
            assert!(node.generator.certified());
            assert_eq!(node.generator.qual(), vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn four_honest_nodes_agree_on_the_master_key() {
        let mut nodes = run_phase_one();

        let all_commits: Vec<SecretCommits> = nodes
            .iter()
            .map(|node| node.generator.secret_commits().unwrap())
            .collect();

        for node in nodes.iter_mut() {
            for commits in &all_commits {
                let complaint = node.generator.process_secret_commits(commits).unwrap();
                assert!(complaint.is_none());
            }

            assert!(node.generator.finished());
        }

        let shares: Vec<DistKeyShare> = nodes
            .iter()
            .map(|node| node.generator.dist_key_share().unwrap())
            .collect();

        let master = shares[0].public_key_set.public_key();
        for share in shares.iter().skip(1) {
            assert_eq!(share.public_key_set.public_key(), master);
        }
    }

    #[test]
    fn shares_combine_into_a_valid_signature() {
        let mut nodes = run_phase_one();

        let all_commits: Vec<SecretCommits> = nodes
            .iter()
            .map(|node| node.generator.secret_commits().unwrap())
            .collect();

        for node in nodes.iter_mut() {
            for commits in &all_commits {
                node.generator.process_secret_commits(commits).unwrap();
            }
        }

        let shares: Vec<DistKeyShare> = nodes
            .iter()
            .map(|node| node.generator.dist_key_share().unwrap())
            .collect();

        let message = b"shared randomness";

        let sig_shares: Vec<_> = shares
            .iter()
            .map(|share| (share.own_index(), share.secret_share.sign(message)))
            .collect();

        let pub_set = &shares[0].public_key_set;
        for (index, sig_share) in &sig_shares {
            assert!(pub_set.public_key_share(*index).verify(sig_share, message));
        }

        let combined = pub_set
            .combine_signatures(
                sig_shares
                    .iter()
                    .take(THRESHOLD + 1)
                    .map(|(index, share)| (*index, share)),
            )
            .unwrap();

        assert!(pub_set.public_key().verify(&combined, message));
    }

    #[test]
    fn rejected_deals_are_justified() {
        let scalars: Vec<Scalar> = (0..NODES).map(|_| Scalar::pick()).collect();
        let points: Vec<Point> = scalars.iter().map(Scalar::public_point).collect();

        let mut nodes: Vec<PolyKeyGenerator> = scalars
            .into_iter()
            .map(|scalar| PolyKeyGenerator::new(scalar, &points, THRESHOLD).unwrap())
            .collect();

        let deals = nodes[0].deals().unwrap();

        // Corrupt the row sent to node 1 by swapping in the row meant for
        // node 2; the commitment no longer matches.
        let mut corrupted = deals.get(&1).unwrap().clone();
        corrupted.row = deals.get(&2).unwrap().row.clone();

        let rejection = nodes[1].process_deal(&corrupted).unwrap();
        assert!(!rejection.approved());

        let justification = nodes[0].process_response(&rejection).unwrap().unwrap();

        // The honest rebuttal carries the true row, which checks out.
        nodes[1].process_justification(&justification).unwrap();
    }
}
