//! Prelude module for common re-exports.
//!
//! Lets consumers do `use shoal_common::prelude::*;` and get the most
//! frequently used types without listing individual paths.

// ─── Logging & Configuration ────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, RuntimeConfig, SharedConfig};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{
    CACHE_LINE_SIZE, DEBUG_FLINCH_ENV_VAR, DEFAULT_MAX_PARTICIPANTS, DEFAULT_REAPER_GRACE_S,
    DEFAULT_SPIN_BACKOFF_MAX, SEGMENT_MAX_SIZE, SEGMENT_MIN_SIZE, SLAB_SIZE_CLASSES,
};
