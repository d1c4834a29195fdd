//! System-wide constants for the shoal workspace.
//!
//! Single source of truth for sizing and timing defaults. Imported by all
//! crates — no duplication permitted.

/// Minimum shared memory segment size in bytes.
///
/// One memory page; segments smaller than this would have excessive
/// allocator overhead relative to payload.
pub const SEGMENT_MIN_SIZE: usize = 4096;

/// Maximum shared memory segment size in bytes.
pub const SEGMENT_MAX_SIZE: usize = 1_073_741_824; // 1GB

/// CPU cache line size in bytes, used for header alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// Size classes served by the slab allocator, in bytes.
pub const SLAB_SIZE_CLASSES: [usize; 6] = [16, 32, 64, 128, 256, 512];

/// Default participant liveness grace period, in seconds, before the
/// coordinator's reaper marks a participant dead.
pub const DEFAULT_REAPER_GRACE_S: u64 = 5;

/// Default maximum capacity of the participant table.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 256;

/// Default spinlock backoff ceiling, in spin iterations, before yielding.
pub const DEFAULT_SPIN_BACKOFF_MAX: u32 = 1024;

/// Environment variable toggling chaos-testing knobs process-wide.
///
/// When set to a truthy value (`"1"`, `"true"`), enables `random_flinch`
/// and `object_debug_stop_on_contention` semantics globally without
/// requiring a config file.
pub const DEBUG_FLINCH_ENV_VAR: &str = "SHOAL_DEBUG_FLINCH";
