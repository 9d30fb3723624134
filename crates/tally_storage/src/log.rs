//! Keyed table log.

use crate::backend::StorageBackend;
use crate::batch::{TableOp, WriteBatch};
use crate::error::{StorageError, StorageResult};
use crate::frame::{encode_frame, scan_frames};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use tracing::{debug, warn};

type Table = BTreeMap<String, Vec<u8>>;

/// Size and shape of a log, for inspection tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Bytes currently held by the backend.
    pub size_bytes: u64,
    /// Row count per non-empty table.
    pub tables: BTreeMap<String, usize>,
}

/// A crash-safe set of string-keyed tables on top of a byte log.
///
/// Every [`WriteBatch`] is appended as one checksummed frame and synced
/// before it becomes visible to readers. On open the frames are replayed
/// in order; a torn final frame is discarded and cut off.
///
/// Readers never block on the backend: the live tables are kept in
/// memory and only writers touch the log.
pub struct KvLog {
    backend: Mutex<Box<dyn StorageBackend>>,
    tables: RwLock<BTreeMap<String, Table>>,
}

impl KvLog {
    /// Opens a log, replaying every committed frame.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be read, a frame in the middle of the
    /// log is corrupted, or a frame cannot be decoded.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        let bytes = backend.read_all()?;
        let scanned = scan_frames(&bytes)?;

        let mut tables = BTreeMap::new();
        for payload in &scanned.payloads {
            let batch = decode_batch(payload)?;
            apply(&mut tables, &batch);
        }

        let size = bytes.len() as u64;
        if scanned.valid_len < size {
            warn!(
                valid = scanned.valid_len,
                size, "discarding torn tail of store log"
            );
            backend.truncate(scanned.valid_len)?;
        }

        debug!(
            frames = scanned.payloads.len(),
            tables = tables.len(),
            "store log opened"
        );

        Ok(Self {
            backend: Mutex::new(backend),
            tables: RwLock::new(tables),
        })
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, table: &str, key: &str) -> Option<Vec<u8>> {
        self.tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    /// Returns true if `key` exists in `table`.
    pub fn contains(&self, table: &str, key: &str) -> bool {
        self.tables
            .read()
            .get(table)
            .is_some_and(|rows| rows.contains_key(key))
    }

    /// Returns every row of `table` in key order.
    pub fn scan(&self, table: &str) -> Vec<(String, Vec<u8>)> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Returns the number of rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Commits a batch.
    ///
    /// The batch is durable when this returns `Ok`. On error nothing of
    /// the batch is visible, in memory or after a reopen.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be encoded or the backend
    /// fails to append or sync.
    pub fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let frame = encode_frame(&encode_batch(&batch)?)?;

        let mut backend = self.backend.lock();
        let before = backend.size()?;
        let appended = match backend.append(&frame) {
            Ok(_) => backend.sync(),
            Err(err) => Err(err),
        };
        if let Err(err) = appended {
            // Best effort: never leave a half-written frame ahead of the
            // next append. Replay would discard it anyway.
            if let Err(rollback) = backend.truncate(before) {
                warn!(error = %rollback, "failed to roll back partial frame");
            }
            return Err(err);
        }

        apply(&mut self.tables.write(), &batch);
        Ok(())
    }

    /// Rewrites the log as a single snapshot frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be encoded or the backend
    /// cannot swap its content. The previous log stays intact.
    pub fn compact(&self) -> StorageResult<()> {
        let mut backend = self.backend.lock();
        let tables = self.tables.read();

        let mut snapshot = WriteBatch::new();
        for (name, rows) in tables.iter() {
            snapshot.clear_table(name.clone());
            for (key, value) in rows {
                snapshot.put(name.clone(), key.clone(), value.clone());
            }
        }

        let before = backend.size()?;
        let frame = if snapshot.is_empty() {
            Vec::new()
        } else {
            encode_frame(&encode_batch(&snapshot)?)?
        };
        backend.replace(&frame)?;

        debug!(before, after = frame.len(), "store log compacted");
        Ok(())
    }

    /// Compacts if the log has grown past `threshold` bytes.
    ///
    /// Returns true if a compaction ran.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`KvLog::compact`].
    pub fn compact_if_larger_than(&self, threshold: u64) -> StorageResult<bool> {
        if self.size_bytes()? <= threshold {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }

    /// Returns the current size of the underlying log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size_bytes(&self) -> StorageResult<u64> {
        self.backend.lock().size()
    }

    /// Returns size and row counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn stats(&self) -> StorageResult<LogStats> {
        let size_bytes = self.size_bytes()?;
        let tables = self
            .tables
            .read()
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, rows)| (name.clone(), rows.len()))
            .collect();
        Ok(LogStats { size_bytes, tables })
    }
}

impl std::fmt::Debug for KvLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvLog")
            .field("tables", &self.tables.read().len())
            .finish_non_exhaustive()
    }
}

fn apply(tables: &mut BTreeMap<String, Table>, batch: &WriteBatch) {
    for op in batch.ops() {
        match op {
            TableOp::Put { table, key, value } => {
                tables
                    .entry(table.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            TableOp::Delete { table, key } => {
                if let Some(rows) = tables.get_mut(table) {
                    rows.remove(key);
                }
            }
            TableOp::ClearTable { table } => {
                tables.remove(table);
            }
        }
    }
}

fn encode_batch(batch: &WriteBatch) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(batch, &mut buf).map_err(StorageError::codec)?;
    Ok(buf)
}

fn decode_batch(payload: &[u8]) -> StorageResult<WriteBatch> {
    ciborium::from_reader(payload).map_err(StorageError::codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileBackend, InMemoryBackend};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn put(table: &str, key: &str, value: &[u8]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(table, key, value.to_vec());
        batch
    }

    #[test]
    fn write_then_read() {
        let log = KvLog::open(Box::new(InMemoryBackend::new())).unwrap();
        log.write(put("challenges", "c-1", b"one")).unwrap();

        assert_eq!(log.get("challenges", "c-1").unwrap(), b"one");
        assert!(log.get("challenges", "missing").is_none());
        assert!(log.get("entries", "c-1").is_none());
        assert!(log.contains("challenges", "c-1"));
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let backend = InMemoryBackend::new();
        let log = KvLog::open(Box::new(backend.clone())).unwrap();
        log.write(WriteBatch::new()).unwrap();
        assert!(backend.data().is_empty());
    }

    #[test]
    fn replay_restores_state() {
        let backend = InMemoryBackend::new();
        {
            let log = KvLog::open(Box::new(backend.clone())).unwrap();
            log.write(put("ledger", "a", b"1")).unwrap();
            log.write(put("ledger", "b", b"2")).unwrap();
            let mut batch = WriteBatch::new();
            batch.delete("ledger", "a");
            batch.put("queue", "7", b"item".to_vec());
            log.write(batch).unwrap();
        }

        let log = KvLog::open(Box::new(backend)).unwrap();
        let ledger: Vec<_> = log.scan("ledger").into_iter().map(|(k, _)| k).collect();
        assert_eq!(ledger, vec!["b".to_string()]);
        assert_eq!(log.get("queue", "7").unwrap(), b"item");
    }

    #[test]
    fn clear_table_only_touches_that_table() {
        let log = KvLog::open(Box::new(InMemoryBackend::new())).unwrap();
        log.write(put("ledger", "a", b"1")).unwrap();
        log.write(put("entries", "e", b"2")).unwrap();

        let mut batch = WriteBatch::new();
        batch.clear_table("ledger");
        log.write(batch).unwrap();

        assert_eq!(log.row_count("ledger"), 0);
        assert_eq!(log.row_count("entries"), 1);
    }

    #[test]
    fn torn_tail_is_discarded_and_truncated() {
        let backend = InMemoryBackend::new();
        {
            let log = KvLog::open(Box::new(backend.clone())).unwrap();
            log.write(put("challenges", "kept", b"v")).unwrap();
        }
        let committed = backend.data().len();
        let torn = encode_frame(&encode_batch(&put("challenges", "lost", b"v")).unwrap()).unwrap();
        backend.inject_garbage(&torn[..torn.len() / 2]);

        let log = KvLog::open(Box::new(backend.clone())).unwrap();
        assert!(log.contains("challenges", "kept"));
        assert!(!log.contains("challenges", "lost"));
        assert_eq!(backend.data().len(), committed);

        // The log stays appendable after recovery.
        log.write(put("challenges", "next", b"v")).unwrap();
        let reopened = KvLog::open(Box::new(backend)).unwrap();
        assert_eq!(reopened.row_count("challenges"), 2);
    }

    #[test]
    fn compaction_preserves_state_and_shrinks_log() {
        let backend = InMemoryBackend::new();
        let log = KvLog::open(Box::new(backend.clone())).unwrap();
        for i in 0..50 {
            log.write(put("entries", "same-key", format!("v{i}").as_bytes()))
                .unwrap();
        }
        let before = log.size_bytes().unwrap();

        assert!(log.compact_if_larger_than(0).unwrap());
        assert!(log.size_bytes().unwrap() < before);
        assert!(!log.compact_if_larger_than(u64::MAX).unwrap());

        let reopened = KvLog::open(Box::new(backend)).unwrap();
        assert_eq!(reopened.get("entries", "same-key").unwrap(), b"v49");
    }

    #[test]
    fn compaction_on_file_backend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");
        {
            let log = KvLog::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
            log.write(put("follows", "f-1", b"x")).unwrap();
            log.write(put("follows", "f-1", b"y")).unwrap();
            log.compact().unwrap();
            log.write(put("follows", "f-2", b"z")).unwrap();
        }

        let log = KvLog::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        assert_eq!(log.get("follows", "f-1").unwrap(), b"y");
        assert_eq!(log.get("follows", "f-2").unwrap(), b"z");
    }

    #[test]
    fn stats_reports_non_empty_tables() {
        let log = KvLog::open(Box::new(InMemoryBackend::new())).unwrap();
        log.write(put("challenges", "a", b"1")).unwrap();
        log.write(put("challenges", "b", b"1")).unwrap();
        let stats = log.stats().unwrap();
        assert_eq!(stats.tables.get("challenges"), Some(&2));
        assert!(stats.size_bytes > 0);
    }

    proptest! {
        #[test]
        fn replay_matches_live_state(
            ops in prop::collection::vec((0u8..3, "[a-c]", prop::collection::vec(any::<u8>(), 0..8)), 1..40)
        ) {
            let backend = InMemoryBackend::new();
            let log = KvLog::open(Box::new(backend.clone())).unwrap();
            for (kind, key, value) in ops {
                let mut batch = WriteBatch::new();
                match kind {
                    0 => batch.put("t", key, value),
                    1 => batch.delete("t", key),
                    _ => batch.clear_table("t"),
                }
                log.write(batch).unwrap();
            }

            let reopened = KvLog::open(Box::new(backend)).unwrap();
            prop_assert_eq!(reopened.scan("t"), log.scan("t"));
        }
    }
}
