//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by validation and encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A field failed local validation.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Human-readable reason.
        message: String,
    },

    /// A value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ProtocolError {
    /// Creates a validation error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}
