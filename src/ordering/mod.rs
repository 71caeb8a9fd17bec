//! Round and block-height bookkeeping for the key generation sub-protocol.

use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifies one full execution of the key generation protocol.
///
/// Round ids grow monotonically on every node. Several rounds may be in
/// flight at once; the round that first yields a verifier supersedes all
/// rounds with a smaller id.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct RoundId(u64);

///Represents a round id that can be bumped from concurrent call sites
pub struct ThreadSafeRoundId(AtomicU64);

impl RoundId {
    /// The round id used before any round was ever started.
    pub const ZERO: Self = RoundId(0);
    pub const ONE: Self = RoundId(1);

    /// Returns the following round id.
    #[inline]
    pub fn next(self) -> RoundId {
        let (next, overflow) = self.0.overflowing_add(1);
        RoundId(if overflow { 0 } else { next })
    }
}

impl From<u64> for RoundId {
    #[inline]
    fn from(round: u64) -> RoundId {
        RoundId(round)
    }
}

impl From<RoundId> for u64 {
    #[inline]
    fn from(round: RoundId) -> u64 {
        round.0
    }
}

impl Display for RoundId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreadSafeRoundId {
    pub fn zero() -> ThreadSafeRoundId {
        ThreadSafeRoundId(AtomicU64::new(0))
    }

    /// Bumps the round id and returns the new value.
    #[inline]
    pub fn bump(&self) -> RoundId {
        RoundId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn current(&self) -> RoundId {
        RoundId(self.0.load(Ordering::Relaxed))
    }
}

/// A block height of the hosting chain.
///
/// The engine never reads wall-clock time; verifier promotion and round
/// auto-start are both driven by heights reported through
/// `check_dkg_time`.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct Height(i64);

impl Height {
    pub const ZERO: Self = Height(0);

    /// Rounds the height down to the nearest multiple of `quantum`.
    ///
    /// Used to pick change heights every node lands on independently.
    #[inline]
    pub fn quantize_down(self, quantum: i64) -> Height {
        Height(self.0 - self.0.rem_euclid(quantum))
    }

    #[inline]
    pub fn is_multiple_of(self, period: i64) -> bool {
        period != 0 && self.0.rem_euclid(period) == 0
    }
}

impl From<i64> for Height {
    #[inline]
    fn from(height: i64) -> Height {
        Height(height)
    }
}

impl From<Height> for i64 {
    #[inline]
    fn from(height: Height) -> i64 {
        height.0
    }
}

impl Add<i64> for Height {
    type Output = Height;

    fn add(self, rhs: i64) -> Self::Output {
        Height(self.0 + rhs)
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents any value bound to a protocol round.
pub trait Orderable {
    /// Returns the round this value belongs to.
    fn round_id(&self) -> RoundId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_down_lands_on_multiples() {
        assert_eq!(Height::from(123).quantize_down(5), Height::from(120));
        assert_eq!(Height::from(120).quantize_down(5), Height::from(120));
        assert_eq!(Height::from(4).quantize_down(5), Height::ZERO);
    }

    #[test]
    fn round_ids_are_monotonic() {
        let counter = ThreadSafeRoundId::zero();

        assert_eq!(counter.current(), RoundId::ZERO);
        assert_eq!(counter.bump(), RoundId::ONE);
        assert_eq!(counter.bump(), RoundId::from(2));
        assert_eq!(counter.current(), RoundId::from(2));
    }
}
