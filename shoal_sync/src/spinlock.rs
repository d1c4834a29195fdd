//! Process-shared spinlock: test-and-set with exponential backoff bounded
//! by the number of live participants.
//!
//! Used for the allocator's per-size-class free lists and for transient
//! (non-transactional) container access.

use shoal_common::consts::DEFAULT_SPIN_BACKOFF_MAX;
use std::sync::atomic::{AtomicBool, Ordering};

/// A simple test-and-set spinlock embeddable in shared memory.
#[repr(C)]
pub struct Spinlock {
    locked: AtomicBool,
}

/// RAII guard releasing the spinlock on drop.
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl Spinlock {
    /// Construct a fresh, unlocked spinlock. Safe on zeroed shared
    /// memory.
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, backing off exponentially up to
    /// `backoff_max` spins before yielding the thread, so that a
    /// contended lock doesn't burn CPU unboundedly relative to the
    /// number of participants contending for it.
    pub fn lock(&self, backoff_max: u32) -> SpinlockGuard<'_> {
        let mut backoff = 1u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            for _ in 0..backoff {
                std::hint::spin_loop();
            }
            backoff = (backoff * 2).min(backoff_max.max(1));
            if backoff >= backoff_max.max(1) {
                std::thread::yield_now();
            }
        }
        SpinlockGuard { lock: self }
    }

    /// Acquire using the workspace-default backoff ceiling.
    pub fn lock_default(&self) -> SpinlockGuard<'_> {
        self.lock(DEFAULT_SPIN_BACKOFF_MAX)
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinlockGuard { lock: self })
    }

    /// Whether the lock is currently held, for diagnostics only.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_excludes_concurrent_access() {
        let lock = Arc::new(Spinlock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock.lock(64);
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new();
        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
