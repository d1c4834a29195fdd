//! Configuration types shared across the shoal workspace.
//!
//! Loading follows the `ConfigLoader` pattern: any `DeserializeOwned` type
//! gets `load()` for free, reading TOML from disk and falling back to
//! `Default` when the file is absent.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::{
    DEBUG_FLINCH_ENV_VAR, DEFAULT_MAX_PARTICIPANTS, DEFAULT_REAPER_GRACE_S,
    DEFAULT_SPIN_BACKOFF_MAX, SEGMENT_MIN_SIZE, SLAB_SIZE_CLASSES,
};

/// Logging verbosity, independent of the `tracing` filter syntax so it can
/// round-trip through TOML config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    /// Render as the string `tracing_subscriber::EnvFilter` expects.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Errors encountered while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("config validation failed: {0}")]
    ValidationError(String),

    #[error("unknown config field: {field}")]
    UnknownField { field: String },
}

/// Fields every shoal process config carries regardless of role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    "shoal".to_string()
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Blanket loader: any deserializable config type gets `load()` from a TOML
/// file on disk, falling back to `Default::default()` when the file is
/// missing.
pub trait ConfigLoader: Sized + Default + for<'de> Deserialize<'de> {
    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        toml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T> ConfigLoader for T where T: Sized + Default + for<'de> Deserialize<'de> {}

/// Tunable knobs for the shared-memory runtime: segment sizing, allocator
/// size classes, coordinator liveness, and chaos-testing overrides.
///
/// Every field carries a serde default so a missing or partial TOML file
/// still produces a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    #[serde(default = "default_slab_size_classes")]
    pub slab_size_classes: Vec<usize>,

    #[serde(default = "default_reaper_grace_s")]
    pub reaper_grace_s: u64,

    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    #[serde(default = "default_spin_backoff_max")]
    pub spin_backoff_max: u32,

    /// Probability in `[0.0, 1.0]` of injecting a spurious abort per commit
    /// attempt, for chaos testing. Zero in production configs.
    #[serde(default)]
    pub random_flinch_probability: f64,
}

fn default_segment_size() -> usize {
    // Must comfortably exceed the fixed-size participant table
    // (`DEFAULT_MAX_PARTICIPANTS` slots at 64 bytes each) plus the
    // metadata page and allocator header before any payload fits.
    SEGMENT_MIN_SIZE * 256
}

fn default_slab_size_classes() -> Vec<usize> {
    SLAB_SIZE_CLASSES.to_vec()
}

fn default_reaper_grace_s() -> u64 {
    DEFAULT_REAPER_GRACE_S
}

fn default_max_participants() -> usize {
    DEFAULT_MAX_PARTICIPANTS
}

fn default_spin_backoff_max() -> u32 {
    DEFAULT_SPIN_BACKOFF_MAX
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            slab_size_classes: default_slab_size_classes(),
            reaper_grace_s: default_reaper_grace_s(),
            max_participants: default_max_participants(),
            spin_backoff_max: default_spin_backoff_max(),
            random_flinch_probability: 0.0,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size < SEGMENT_MIN_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "segment_size {} below minimum {}",
                self.segment_size, SEGMENT_MIN_SIZE
            )));
        }
        if self.slab_size_classes.is_empty() {
            return Err(ConfigError::ValidationError(
                "slab_size_classes must not be empty".into(),
            ));
        }
        if !self.slab_size_classes.windows(2).all(|w| w[0] < w[1]) {
            return Err(ConfigError::ValidationError(
                "slab_size_classes must be strictly ascending".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.random_flinch_probability) {
            return Err(ConfigError::ValidationError(
                "random_flinch_probability must be within [0.0, 1.0]".into(),
            ));
        }
        Ok(())
    }

    /// Applies the `SHOAL_DEBUG_FLINCH` environment override, letting
    /// operators enable chaos testing without editing a config file.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var(DEBUG_FLINCH_ENV_VAR) {
            if val == "1" || val.eq_ignore_ascii_case("true") {
                if self.random_flinch_probability == 0.0 {
                    self.random_flinch_probability = 0.01;
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn shared_config_defaults_validate() {
        let cfg = SharedConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.log_level, LogLevel::Info);
    }

    #[test]
    fn shared_config_rejects_empty_service_name() {
        let cfg = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "  ".into(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn runtime_config_defaults_validate() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.slab_size_classes, SLAB_SIZE_CLASSES.to_vec());
    }

    #[test]
    fn runtime_config_rejects_tiny_segment() {
        let mut cfg = RuntimeConfig::default();
        cfg.segment_size = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn runtime_config_rejects_unsorted_size_classes() {
        let mut cfg = RuntimeConfig::default();
        cfg.slab_size_classes = vec![64, 32];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loader_falls_back_to_default_when_file_missing() {
        let cfg = RuntimeConfig::load("/nonexistent/path/shoal.toml").unwrap();
        assert_eq!(cfg.segment_size, RuntimeConfig::default().segment_size);
    }

    #[test]
    fn loader_reads_partial_toml_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "reaper_grace_s = 30").unwrap();
        let cfg = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(cfg.reaper_grace_s, 30);
        assert_eq!(cfg.segment_size, RuntimeConfig::default().segment_size);
    }
}
