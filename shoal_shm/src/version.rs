//! Atomic version counter for optimistic concurrency control.
//!
//! Every object header and the segment metadata page embed one. A
//! committed write bumps it by exactly one; a rolled-back transaction
//! never touches it (see the version-monotonicity invariant).

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing per-object version number.
#[derive(Debug)]
pub struct VersionCounter {
    counter: AtomicU64,
}

impl VersionCounter {
    /// Create a new version counter starting at 0.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Create a version counter from an existing raw value (used when
    /// reconstructing a header view over already-initialized memory).
    pub fn from_raw(value: u64) -> Self {
        Self {
            counter: AtomicU64::new(value),
        }
    }

    /// Load the current version with acquire ordering.
    pub fn load(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Overwrite the version with release ordering.
    pub fn store(&self, value: u64) {
        self.counter.store(value, Ordering::Release);
    }

    /// Bump the version by one, as the commit protocol does when
    /// publishing a write. Returns the new version.
    pub fn bump(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Compare-and-swap the raw value, used to detect a concurrent bump
    /// between a transaction's first read and its commit-time validation.
    pub fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.counter
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

impl Default for VersionCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let counter = VersionCounter::new();
        assert_eq!(counter.load(), 0);
    }

    #[test]
    fn bump_increments_by_one() {
        let counter = VersionCounter::new();
        assert_eq!(counter.bump(), 1);
        assert_eq!(counter.bump(), 2);
        assert_eq!(counter.load(), 2);
    }

    #[test]
    fn compare_exchange_detects_concurrent_bump() {
        let counter = VersionCounter::new();
        counter.bump();
        assert!(counter.compare_exchange(0, 5).is_err());
        assert!(counter.compare_exchange(1, 5).is_ok());
        assert_eq!(counter.load(), 5);
    }
}
