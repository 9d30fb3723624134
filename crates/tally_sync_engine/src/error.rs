//! Error types for the sync engine.

use tally_storage::StorageError;
use tally_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The server could not be reached.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// The server failed with a transient error.
    #[error("server error: {message}")]
    Remote {
        /// Error message.
        message: String,
    },

    /// Credentials are missing or were refused.
    #[error("authentication required: {message}")]
    AuthRequired {
        /// Error message.
        message: String,
    },

    /// A payload failed validation, locally or on the server.
    #[error("validation failed: {message}")]
    Validation {
        /// Error message.
        message: String,
    },

    /// The referenced entity no longer exists on the server.
    #[error("conflict: {message}")]
    Conflict {
        /// Error message.
        message: String,
    },

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored value could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The operation needs the synced backend.
    #[error("operation requires the synced backend")]
    LocalOnly,

    /// A mutation referenced an entity that does not exist locally.
    #[error("entity not found: {id}")]
    NotFound {
        /// Missing entity key or id.
        id: String,
    },

    /// A change could not be applied to the requested entity.
    #[error("invalid change: {message}")]
    InvalidChange {
        /// Error message.
        message: String,
    },
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network { .. } | SyncError::Remote { .. })
    }

    /// Returns true if retrying the same queue item can never succeed.
    pub fn is_terminal_for_item(&self) -> bool {
        matches!(
            self,
            SyncError::Validation { .. } | SyncError::Conflict { .. }
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Invalid { .. } => SyncError::Validation {
                message: err.to_string(),
            },
            ProtocolError::Codec(_) => SyncError::Protocol(err),
        }
    }
}
