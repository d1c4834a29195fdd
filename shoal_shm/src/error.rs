//! Error types for the shared-memory segment, allocator, and coordinator.
//!
//! Transaction-engine-specific kinds (`ShmAbort`, `WaitInsideTransaction`, …)
//! are declared here rather than in `shoal_txn` because they can also
//! originate from the allocator (`OutOfMemory`) and the object header
//! (`Corruption`) — any layer below the engine can raise them.

use thiserror::Error;

/// Errors that can occur during shared memory operations.
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment already exists under this name.
    #[error("segment already exists: {name}")]
    AlreadyExists {
        /// Segment name.
        name: String,
    },

    /// Segment, object, or map key not found.
    #[error("not found: {name}")]
    NotFound {
        /// Name or description of the missing item.
        name: String,
    },

    /// Invalid segment size.
    #[error("invalid segment size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes.
        size: usize,
    },

    /// The attaching process's layout version does not match the segment's.
    #[error("layout version mismatch")]
    VersionMismatch,

    /// Permission denied accessing segment backing storage.
    #[error("permission denied accessing segment: {name}")]
    PermissionDenied {
        /// Segment name.
        name: String,
    },

    /// The OS refused to create or grow the mapping.
    #[error("out of OS resources creating segment")]
    OutOfResources,

    /// The allocator could not satisfy a request. The allocator itself
    /// always reports `retryable: false` — it has no visibility into
    /// reclamation; the transaction engine attempts a sweep and retries
    /// once before surfacing this, upgrading to `retryable: true` if that
    /// sweep freed anything or left something still queued for a later
    /// epoch.
    #[error("allocator out of memory")]
    OutOfMemory {
        /// Whether a caller's retry loop should roll back and retry.
        retryable: bool,
    },

    /// A transaction was aborted due to conflict during commit or
    /// validation. Recoverable: the retry loop should roll back and
    /// re-enter the user region.
    #[error("transaction aborted on conflict")]
    ShmAbort,

    /// `promise.wait` was called from inside an active transaction.
    #[error("promise.wait called inside a transaction")]
    WaitInsideTransaction,

    /// A blocking operation (sleep, OS wait, process spawn) was attempted
    /// inside an active transaction.
    #[error("blocking operation attempted inside a transaction")]
    BlockingInsideTransaction,

    /// Memory alignment error.
    #[error("memory alignment error: address {address:#x} not aligned to {alignment}")]
    AlignmentError {
        /// Memory address.
        address: usize,
        /// Required alignment.
        alignment: usize,
    },

    /// Process not found or already dead.
    #[error("process not found: {pid}")]
    ProcessNotFound {
        /// Process ID.
        pid: u32,
    },

    /// Header magic or an invariant was violated. The engine must not
    /// continue after this.
    #[error("segment corruption detected: {detail}")]
    Corruption {
        /// Description of what was found inconsistent.
        detail: String,
    },

    /// An OS wait (`promise.wait`) was interrupted by a signal. Returned to
    /// the caller, not treated as an engine failure.
    #[error("wait interrupted")]
    Interrupted,

    /// IO error.
    #[error("IO error: {source}")]
    Io {
        /// Source IO error.
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error.
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error.
        #[from]
        source: nix::Error,
    },
}

impl ShmError {
    /// Whether the caller's retry loop should roll back and re-enter the
    /// user region, as opposed to propagating the error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShmError::ShmAbort) || matches!(self, ShmError::OutOfMemory { retryable: true })
    }
}

/// Result type for shared memory operations.
pub type ShmResult<T> = Result<T, ShmError>;
