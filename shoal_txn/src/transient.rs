//! Transient escape regions: `transient_begin`/`transient_end` bracket a
//! direct, non-transactional read-modify-write against a single object,
//! for the narrow cases (metrics counters, debug scratch state) where
//! paying for a full transaction isn't worth it.
//!
//! A transient region borrows the same `owner_tx_id` CAS a transaction's
//! write lock uses, under a reserved id no real transaction ever holds.
//! Unlike the commit protocol it does not validate a prior read's
//! version — it has none to validate — so it spins until the object is
//! unlocked rather than aborting on the first conflict.

use shoal_common::consts::DEFAULT_SPIN_BACKOFF_MAX;
use shoal_shm::{Handle, Segment};

/// Reserved transaction id no `TransactionContext` ever assigns, used to
/// mark an object as held by a transient region rather than a
/// transaction.
const TRANSIENT_TX_ID: u64 = u64::MAX;

/// Acquire transient, non-transactional exclusive access to `handle`.
/// Spins with the same exponential-backoff shape as
/// [`shoal_sync::Spinlock`] until the object is unlocked by whichever
/// transaction or transient region currently holds it.
pub fn begin(segment: &Segment, handle: Handle) -> TransientGuard<'_> {
    let header = segment.header(handle);
    let mut backoff = 1u32;
    loop {
        let version = header.version.load();
        if header.try_lock(TRANSIENT_TX_ID, version).is_ok() {
            break;
        }
        for _ in 0..backoff {
            std::hint::spin_loop();
        }
        backoff = (backoff * 2).min(DEFAULT_SPIN_BACKOFF_MAX);
        if backoff >= DEFAULT_SPIN_BACKOFF_MAX {
            std::thread::yield_now();
        }
    }
    TransientGuard { segment, handle }
}

/// Holds transient exclusive access until dropped or [`end`] is called
/// explicitly, matching the external interface's explicit
/// `transient_begin`/`transient_end` pair.
pub struct TransientGuard<'a> {
    segment: &'a Segment,
    handle: Handle,
}

impl TransientGuard<'_> {
    /// This region's object, for direct payload access.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// End the region, releasing the lock and bumping the version so
    /// concurrent readers observe the change.
    pub fn end(self) {
        drop(self);
    }
}

impl Drop for TransientGuard<'_> {
    fn drop(&mut self) {
        let header = self.segment.header(self.handle);
        header.bump_version();
        header.unlock(TRANSIENT_TX_ID);
    }
}
