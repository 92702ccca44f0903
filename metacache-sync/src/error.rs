//! Error types for the sync layer.

use metacache_store::StoreError;
use metacache_types::SyncPhase;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for remote source calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a [`MetadataSource`](crate::MetadataSource).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure (connection, TLS, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The remote answered with a non-success status.
    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    #[error("operation timed out")]
    Timeout,
}

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The installed module list could not be turned into a fingerprint.
    #[error("version detection failed: {0}")]
    Detection(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// A remote call failed while running a phase.
    #[error("remote fetch failed during {phase}: {source}")]
    RemoteFetch {
        phase: SyncPhase,
        #[source]
        source: RemoteError,
    },

    /// Another session is already running for the environment.
    #[error("a sync session is already running for {environment}")]
    SessionConflict { environment: String },

    /// Session not found.
    #[error("sync session not found: {0}")]
    SessionNotFound(String),

    /// The session was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Sharing mode found no fully populated version to bind to.
    #[error("no fully populated version is available to share: {0}")]
    SharingUnavailable(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task failed to complete.
    #[error("task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Phase the error occurred in, when it is tied to one.
    pub fn phase(&self) -> Option<SyncPhase> {
        match self {
            Self::RemoteFetch { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
