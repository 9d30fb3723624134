//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte log underneath a [`crate::KvLog`].
///
/// Backends are **opaque byte stores**. They never interpret frames,
/// tables or records; the log layer owns the format.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns exactly the bytes appended so far (after the
///   last `replace` or `truncate`)
/// - `sync` makes every appended byte durable
/// - `replace` swaps the whole content atomically: after a crash the
///   backend holds either the old or the new bytes, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads the complete content of the log.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the log.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Returns the current size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all appended data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the log to `new_size` bytes.
    ///
    /// Used to cut off a torn tail frame found during replay.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size
    /// or the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole log with `data`.
    ///
    /// Used by compaction to swap a long history for a single snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the new content cannot be made durable. The
    /// previous content must still be intact in that case.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
