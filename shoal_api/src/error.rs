//! Facade-level error type, aggregating the transaction engine, the
//! shared value types, and the segment layer via `#[from]`.

use shoal_objects::ObjectsError;
use shoal_shm::ShmError;
use shoal_txn::TxnError;
use thiserror::Error;

/// Errors the collaborator-facing facade can raise.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Propagated from a shared value type operation.
    #[error(transparent)]
    Objects(#[from] ObjectsError),

    /// Propagated from the transaction engine.
    #[error(transparent)]
    Txn(#[from] TxnError),

    /// Propagated from the segment layer directly (`init`/`connect`).
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// Propagated from loading `RuntimeConfig`.
    #[error(transparent)]
    Config(#[from] shoal_common::config::ConfigError),

    /// A facade call was made before `init`/`connect` established a
    /// segment attachment for this process.
    #[error("facade not initialized: call init() or connect() first")]
    NotInitialized,

    /// `init`/`connect` was called twice in the same process.
    #[error("facade already initialized")]
    AlreadyInitialized,

    /// `txn_commit`/`txn_rollback`/`txn_rollback_retaining` was called
    /// with no transaction open on this task.
    #[error("no transaction is active on this task")]
    NoActiveTransaction,

    /// A joining process gave up waiting for the creator to publish the
    /// root handle.
    #[error("timed out waiting for segment root to be published")]
    RootNotPublished,
}

/// Result type for facade operations.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Whether the caller's retry loop should roll back and retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Objects(e) => e.is_retryable(),
            ApiError::Txn(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Lets facade functions be called with `?` directly inside a
/// `with_ctx` body: a propagated engine/object error keeps its
/// retryability, anything facade-specific becomes a non-retryable user
/// abort.
impl From<ApiError> for TxnError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Txn(inner) => inner,
            ApiError::Objects(inner) => inner.into(),
            other => TxnError::UserAborted(other.to_string()),
        }
    }
}
