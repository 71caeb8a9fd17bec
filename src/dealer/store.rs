//! Per-round storage: the public key roster and the per-phase bounded
//! inboxes.

use std::collections::BTreeMap;

use crate::crypto::signature::ValidatorAddress;
use crate::crypto::threshold::Point;

/// The ordered roster of per-round public keys, one per validator.
///
/// Once all keys are present the store is sorted by address; the
/// position in that sorting is the canonical participant index every
/// deal and response refers to.
pub struct PkStore {
    entries: Vec<(ValidatorAddress, Point)>,
}

impl PkStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a key for an address.
    ///
    /// Re-registering the identical pair is a no-op. A *different* key
    /// for a known address is dropped as well: the roster never holds
    /// two entries per address, which keeps the participant index
    /// well defined.
    pub fn add(&mut self, addr: ValidatorAddress, point: Point) -> bool {
        if self.entries.iter().any(|(existing, _)| *existing == addr) {
            return false;
        }

        self.entries.push((addr, point));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorts the roster byte-lexicographically by address.
    pub fn sort(&mut self) {
        self.entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    }

    /// The position of `addr` in the sorted roster.
    pub fn index_of(&self, addr: &ValidatorAddress) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing == addr)
    }

    pub fn addr_at(&self, index: usize) -> Option<ValidatorAddress> {
        self.entries.get(index).map(|(addr, _)| *addr)
    }

    /// The keys in roster order.
    pub fn points(&self) -> Vec<Point> {
        self.entries.iter().map(|(_, point)| point.clone()).collect()
    }
}

impl Default for PkStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded per-peer inbox for one protocol phase.
///
/// Keeps at most `max_messages_from_peer` entries per address, dropping
/// the rest silently, and maintains a monotone total count the phase
/// readiness predicates are evaluated against. Entries are also indexed
/// by the sender's participant index for the phases that look peers up
/// that way.
pub struct MessageStore<P> {
    messages_count: usize,
    max_messages_from_peer: usize,
    addr_to_data: BTreeMap<ValidatorAddress, Vec<P>>,
    index_to_data: BTreeMap<usize, Vec<P>>,
}

impl<P: Clone> MessageStore<P> {
    pub fn new(max_messages_from_peer: usize) -> Self {
        Self {
            messages_count: 0,
            max_messages_from_peer,
            addr_to_data: BTreeMap::new(),
            index_to_data: BTreeMap::new(),
        }
    }

    /// Stores a message, unless the sender already used up its quota.
    pub fn add(&mut self, addr: ValidatorAddress, index: usize, value: P) -> bool {
        let bucket = self.addr_to_data.entry(addr).or_default();

        if bucket.len() == self.max_messages_from_peer {
            return false;
        }

        bucket.push(value.clone());
        self.index_to_data.entry(index).or_default().push(value);

        self.messages_count += 1;
        true
    }

    pub fn messages_count(&self) -> usize {
        self.messages_count
    }

    pub fn contains(&self, addr: &ValidatorAddress) -> bool {
        self.addr_to_data.contains_key(addr)
    }

    pub fn first_from(&self, addr: &ValidatorAddress) -> Option<&P> {
        self.addr_to_data.get(addr).and_then(|bucket| bucket.first())
    }

    /// All stored messages, grouped by sender address.
    pub fn iter_by_addr(&self) -> impl Iterator<Item = (&ValidatorAddress, &Vec<P>)> {
        self.addr_to_data.iter()
    }

    /// All stored messages in one sequence.
    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.addr_to_data.values().flatten()
    }

    pub fn values_for_index(&self, index: usize) -> Option<&Vec<P>> {
        self.index_to_data.get(&index)
    }

    pub fn senders(&self) -> usize {
        self.addr_to_data.len()
    }
}
