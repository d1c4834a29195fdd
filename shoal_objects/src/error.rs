//! Errors raised by the shared value types, layered over [`TxnError`].

use shoal_shm::ShmError;
use shoal_txn::TxnError;
use thiserror::Error;

/// Errors the container and scalar wrappers can raise.
#[derive(Error, Debug)]
pub enum ObjectsError {
    /// Propagated from the transaction engine or segment layer.
    #[error(transparent)]
    Txn(#[from] TxnError),

    /// A scalar payload didn't decode to a recognized kind — segment
    /// corruption or a handle of the wrong tag was passed in.
    #[error("corrupt scalar payload")]
    CorruptScalar,

    /// `list.get`/`list.set` index was out of bounds.
    #[error("list index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    /// `list.pop_front` called on an empty list.
    #[error("pop_front called on an empty list")]
    PopFromEmptyList,

    /// `map.get`/`map.delete` on a key that isn't present.
    #[error("key not found")]
    KeyNotFound,

    /// `promise.wait` was called from inside an active transaction.
    #[error("promise.wait called inside a transaction")]
    WaitInsideTransaction,

    /// `promise.wait` elapsed its timeout before being signaled.
    #[error("promise.wait timed out")]
    WaitTimedOut,

    /// `promise.wait`'s OS wait was interrupted by a signal. Returned to
    /// the caller rather than treated as an engine failure, since a
    /// signal interrupting a wait isn't itself a malfunction.
    #[error("promise.wait interrupted")]
    Interrupted,
}

/// Result type for shared value type operations.
pub type ObjectsResult<T> = Result<T, ObjectsError>;

/// Bare segment-level errors (raw backing-storage alloc/free) fold into
/// the same `Txn` variant as engine errors, so retryability is never
/// lost just because a call happened to land on the raw-storage path.
impl From<ShmError> for ObjectsError {
    fn from(e: ShmError) -> Self {
        ObjectsError::Txn(TxnError::from(e))
    }
}

impl ObjectsError {
    /// Whether the caller's retry loop should roll back and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ObjectsError::Txn(e) if e.is_retryable())
    }
}

/// Lets container methods be called with `?` directly inside a
/// transaction body closure (which must return a `TxnResult`): a
/// propagated engine error keeps its retryability, anything
/// object-specific becomes a non-retryable user abort.
impl From<ObjectsError> for TxnError {
    fn from(e: ObjectsError) -> Self {
        match e {
            ObjectsError::Txn(inner) => inner,
            other => TxnError::UserAborted(other.to_string()),
        }
    }
}
