//! Errors for the workflow state store.

use std::path::PathBuf;

use thiserror::Error;

/// Surface error type for all store operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// Envelope or snapshot checksum mismatch on load/restore.
    #[error("state corrupted: {0}")]
    StateCorrupted(String),

    /// Global lock held by a live process or created concurrently.
    #[error("failed to acquire state lock: {0}")]
    LockAcquireFailed(String),

    /// Global lock release attempted by a non-owner.
    #[error("failed to release state lock: {0}")]
    LockReleaseFailed(String),

    /// Workflow lock refresh attempted without holding the lock.
    #[error("lock not held for workflow {0}")]
    LockNotHeld(String),

    /// Per-workflow lock already held by another holder.
    #[error("lock already held for workflow {0}")]
    WorkflowLockHeld(String),

    /// Duplicate registration in the running-workflow registry.
    #[error("workflow {0} is already running")]
    WorkflowAlreadyRunning(String),

    /// Referenced workflow, registry row or board entry does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A file path resolved outside the state directory.
    #[error("path escapes state directory: {}", .0.display())]
    PathOutsideStateDir(PathBuf),

    /// A cancellation token fired while a write was waiting to retry.
    /// Carries the last busy error observed before cancellation.
    #[error("operation {op} cancelled: {last_error}")]
    Cancelled { op: String, last_error: String },

    /// The store has been closed.
    #[error("state store is closed")]
    Closed,

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Create a not-found error for the given entity kind and id.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether this error is a transient busy/locked signal from `SQLite`.
    ///
    /// Busy errors are retried by the write executor; everything else
    /// propagates immediately.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sql(rusqlite::Error::SqliteFailure(failure, message)) => {
                matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) || message.as_deref().is_some_and(is_busy_message)
            }
            Self::Sql(other) => is_busy_message(&other.to_string()),
            Self::Other(err) => is_busy_message(&err.to_string()),
            _ => false,
        }
    }
}

fn is_busy_message(message: &str) -> bool {
    message.contains("database is locked")
        || message.contains("SQLITE_BUSY")
        || message.contains("SQLITE_LOCKED")
}
