//! Transaction-engine error type.
//!
//! Wraps the lower layer's [`ShmError`] (segment/allocator/corruption
//! failures) alongside the two misuse kinds that only the engine itself
//! can detect: blocking inside a transaction and waiting inside one.

use shoal_shm::ShmError;
use thiserror::Error;

/// Errors the transaction engine can raise.
#[derive(Error, Debug)]
pub enum TxnError {
    /// Propagated from the segment/allocator layer. `ShmAbort` and a
    /// reclaimable `OutOfMemory` are retryable; everything else is
    /// fatal to the current process per the layer's own policy.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// A blocking operation (sleep, OS wait, process spawn) was
    /// attempted while a transaction was active.
    #[error("blocking operation attempted inside a transaction")]
    BlockingInsideTransaction,

    /// `promise.wait` was called from inside an active transaction.
    #[error("promise.wait called inside a transaction")]
    WaitInsideTransaction,

    /// The user-supplied transaction body raised a non-retryable error;
    /// the engine rolled back and is now surfacing it unchanged.
    #[error("transaction body raised: {0}")]
    UserAborted(String),
}

impl TxnError {
    /// Whether the caller's retry loop should roll back and re-enter the
    /// user region (true) or propagate the error to the caller (false).
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxnError::Shm(e) if e.is_retryable())
    }
}

/// Result type for transaction-engine operations.
pub type TxnResult<T> = Result<T, TxnError>;
