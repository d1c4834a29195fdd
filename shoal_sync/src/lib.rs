//! Shoal Sync
//!
//! Cross-process coordination primitives used above the raw segment:
//! a futex-like [`event::Event`] and a [`spinlock::Spinlock`] for header
//! and free-list CAS protection.

pub mod event;
pub mod spinlock;

pub use event::{Event, WaitResult};
pub use spinlock::{Spinlock, SpinlockGuard};
