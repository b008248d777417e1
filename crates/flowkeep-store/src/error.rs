//! Error types for the flowkeep-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Every variant carries the process id and instance id (or the backend
//! operation) it failed on, so callers can decide between retrying,
//! re-reading, or escalating without parsing strings.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::codec::CodecError;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the instance store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `create` was called with an id that is already stored.
    #[error("process instance {process_id}/{id} already exists")]
    DuplicateId { process_id: String, id: String },

    /// A compare-and-swap write found a different version than the one
    /// captured by the last locking read.
    #[error(
        "optimistic lock conflict on {process_id}/{id}: expected version {expected}, found {}",
        display_version(.actual)
    )]
    OptimisticLock {
        process_id: String,
        id: String,
        expected: u64,
        actual: Option<u64>,
    },

    /// The stored bytes could not be decoded back into an instance.
    #[error("corrupt state for {process_id}/{id}: {source}")]
    CorruptState {
        process_id: String,
        id: String,
        #[source]
        source: CodecError,
    },

    /// The live instance could not be encoded; nothing was written.
    #[error("failed to encode {process_id}/{id}: {source}")]
    Marshal {
        process_id: String,
        id: String,
        #[source]
        source: CodecError,
    },

    /// The backend could not be reached or is temporarily refusing work.
    #[error("backend unavailable during {operation}: {reason}")]
    BackendUnavailable {
        operation: &'static str,
        reason: String,
    },

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// No process definition is registered under the given id.
    #[error("unknown process: {0}")]
    UnknownProcess(String),

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

fn display_version(version: &Option<u64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

impl StoreError {
    /// Whether the operation may succeed if the caller tries again.
    ///
    /// Optimistic lock conflicts need a fresh locking read first; backend
    /// outages need backoff. Everything else fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OptimisticLock { .. } | Self::BackendUnavailable { .. }
        )
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure,
            ) => Self::BackendUnavailable {
                operation: "sqlite",
                reason: err.to_string(),
            },
            _ => Self::Sqlite(err),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
