//! Platform-specific segment mapping and process liveness.

pub mod linux;
pub use linux::*;
