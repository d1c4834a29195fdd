//! # Shoal Shared Memory
//!
//! Segment lifecycle, sub-allocator, handles, object headers, and
//! coordinator/participant-table state for the shoal shared-object
//! system.
//!
//! This crate owns everything that lives at a fixed, bit-exact offset
//! inside the shared segment: the [`segment::MetadataPage`], the
//! [`coordinator::ParticipantTable`], the [`allocator::AllocatorHeader`]
//! and its two sub-allocators, and the [`handle::ObjectHeader`] prefix
//! every allocation carries. The transaction engine (`shoal_txn`) and the
//! typed object model (`shoal_objects`) are built on top of the API here;
//! this crate has no notion of transactions or typed payloads, only
//! bytes, offsets, and headers.
//!
//! ## Module structure
//!
//! - [`segment`] — the mmap'd region and its metadata page
//! - [`allocator`] — size-class slab allocator + coalescing free-list allocator
//! - [`coordinator`] — participant table, liveness heartbeat, reaper
//! - [`handle`] — segment-relative handles and the object header
//! - [`version`] — the atomic version counter shared by headers and the metadata page
//! - [`platform`] — OS-specific mmap creation and process liveness checks
//! - [`error`] — `ShmError` / `ShmResult`

#![warn(clippy::all)]

pub mod allocator;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod platform;
pub mod segment;
pub mod session;
pub mod version;

pub use allocator::{AllocatorHeader, alloc, free_slab};
pub use coordinator::{ParticipantEntry, ParticipantTable, Reaper};
pub use error::{ShmError, ShmResult};
pub use handle::{Handle, HeaderFlags, ObjectHeader, ObjectTag, OBJECT_HEADER_SIZE};
pub use session::Segment;
pub use segment::{MetadataPage, SharedMemorySegment, LAYOUT_VERSION, SEGMENT_MAGIC};
pub use version::VersionCounter;

/// Initialize a `tracing` subscriber suitable for shoal binaries
/// (coordinator daemon, collaborator processes): no target module path,
/// thread ids, and line numbers, reading verbosity from `RUST_LOG`/the
/// environment the way the rest of the workspace's `EnvFilter` usage does.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
