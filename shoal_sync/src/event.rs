//! Process-shared futex-like event.
//!
//! A small struct containing an atomic state word, embeddable directly
//! inside a shared-memory segment so that processes that never shared a
//! heap can still wait on and signal the same event. On Linux this is a
//! real `futex(2)` wait, giving OS-level blocking instead of a spin loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const UNSIGNALED: u32 = 0;
const SIGNALED: u32 = 1;

/// Outcome of a `wait` call, mirroring the three cases the spec names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The event was signaled.
    Signaled,
    /// The timeout elapsed before the event was signaled.
    Timeout,
    /// The wait was interrupted by a signal before the event was
    /// signaled or the timeout elapsed.
    Interrupted,
}

/// A process-shared event: `wait` blocks until `signal` is called (or the
/// timeout elapses); `signal` wakes every waiter and is idempotent —
/// calling it again after the first call is a no-op.
#[repr(C)]
pub struct Event {
    state: AtomicU32,
}

impl Event {
    /// Construct a fresh, unsignaled event. Safe to call on zeroed shared
    /// memory (the all-zero bit pattern is already unsignaled).
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(UNSIGNALED),
        }
    }

    /// Whether the event has been signaled.
    pub fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALED
    }

    /// Signal the event, waking all current and future waiters. Returns
    /// `true` if this call performed the transition (i.e., it was the
    /// first signal); a second call is a no-op and returns `false`.
    pub fn signal(&self) -> bool {
        if self
            .state
            .compare_exchange(UNSIGNALED, SIGNALED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            platform::wake_all(&self.state);
            true
        } else {
            false
        }
    }

    /// Block until signaled, interrupted, or `timeout` elapses. A `None`
    /// timeout blocks indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        loop {
            if self.is_signaled() {
                return WaitResult::Signaled;
            }
            let remaining = match deadline {
                Some(d) => {
                    let now = std::time::Instant::now();
                    if now >= d {
                        return WaitResult::Timeout;
                    }
                    Some(d - now)
                }
                None => None,
            };
            match platform::futex_wait(&self.state, UNSIGNALED, remaining) {
                platform::FutexWaitOutcome::WokenOrChanged => continue,
                platform::FutexWaitOutcome::Timeout => return WaitResult::Timeout,
                platform::FutexWaitOutcome::Interrupted => return WaitResult::Interrupted,
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    pub enum FutexWaitOutcome {
        WokenOrChanged,
        Timeout,
        Interrupted,
    }

    pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWaitOutcome {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const libc::timespec)
            .unwrap_or(std::ptr::null());

        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0,
            )
        };

        if rc == 0 {
            FutexWaitOutcome::WokenOrChanged
        } else {
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) => FutexWaitOutcome::WokenOrChanged,
                Some(libc::ETIMEDOUT) => FutexWaitOutcome::Timeout,
                Some(libc::EINTR) => FutexWaitOutcome::Interrupted,
                _ => FutexWaitOutcome::WokenOrChanged,
            }
        }
    }

    pub fn wake_all(word: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                libc::FUTEX_WAKE,
                i32::MAX,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    pub enum FutexWaitOutcome {
        WokenOrChanged,
        Timeout,
    }

    /// Spin-with-backoff fallback for non-Linux targets: there is no
    /// portable process-shared futex, so we poll.
    pub fn futex_wait(_word: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> FutexWaitOutcome {
        let poll_interval = Duration::from_millis(1);
        std::thread::sleep(timeout.map(|d| d.min(poll_interval)).unwrap_or(poll_interval));
        FutexWaitOutcome::WokenOrChanged
    }

    pub fn wake_all(_word: &AtomicU32) {}
}
