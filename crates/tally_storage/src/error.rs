//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame in the middle of the log failed validation.
    #[error("storage corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the offending frame.
        offset: u64,
        /// What was wrong with it.
        message: String,
    },

    /// Checksum mismatch on a frame.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A batch could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Another process holds the store.
    #[error("store is locked by another process: {path}")]
    Locked {
        /// Path of the locked store file.
        path: String,
    },

    /// A repair tried to cut the log beyond its end.
    #[error("cannot truncate to {requested} bytes, log holds {size}")]
    TruncatePastEnd {
        /// Requested length.
        requested: u64,
        /// Actual length.
        size: u64,
    },

    /// A single batch exceeded the frame size limit.
    #[error("batch of {size} bytes exceeds the frame limit")]
    BatchTooLarge {
        /// Encoded batch size.
        size: usize,
    },
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec(message.to_string())
    }
}
