//! Error types for the storage layer.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store file could not be opened or is no longer usable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A uniqueness or check constraint rejected a write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// An ad-hoc query or search pattern was rejected before execution.
    #[error("query rejected: {0}")]
    QuerySafety(String),

    /// Row not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Invalid data read back from the store.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Whether the error means the store itself is unusable (I/O failure,
    /// corruption, lock poisoning) rather than a problem with one request.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::DiskFull
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied
            ),
            _ => false,
        }
    }

    /// Whether the error is a constraint violation reported by SQLite.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::ConstraintViolation(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

impl From<metacache_types::Error> for StoreError {
    fn from(e: metacache_types::Error) -> Self {
        Self::InvalidData(e.to_string())
    }
}
