//! # Tally Storage
//!
//! Durable keyed storage for the Tally sync engine.
//!
//! The crate has two layers:
//!
//! - **Backends** are opaque byte logs (read everything, append, sync,
//!   truncate, replace). They know nothing about tables or records.
//! - [`KvLog`] interprets a backend as a sequence of checksummed frames.
//!   Every frame carries one [`WriteBatch`] of table operations and is
//!   applied all-or-nothing when the log is replayed.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - Persistent, exclusively locked single-file store
//!
//! ## Example
//!
//! ```rust
//! use tally_storage::{InMemoryBackend, KvLog, WriteBatch};
//!
//! let log = KvLog::open(Box::new(InMemoryBackend::new())).unwrap();
//! let mut batch = WriteBatch::new();
//! batch.put("challenges", "c-1", b"payload".to_vec());
//! log.write(batch).unwrap();
//! assert_eq!(log.get("challenges", "c-1").as_deref(), Some(&b"payload"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod batch;
mod error;
mod file;
mod frame;
mod log;
mod memory;

pub use backend::StorageBackend;
pub use batch::{TableOp, WriteBatch};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use frame::{compute_crc32, FRAME_MAGIC, FRAME_VERSION};
pub use log::{KvLog, LogStats};
pub use memory::InMemoryBackend;
