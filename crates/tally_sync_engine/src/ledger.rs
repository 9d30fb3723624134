//! Pending change ledger.

use crate::error::SyncResult;
use crate::store::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tally_storage::{KvLog, WriteBatch};
use tally_sync_protocol::{from_cbor, to_cbor, ChangeKind, Collection, EntityKey, PendingChange};
use tracing::debug;

pub(crate) const LEDGER_TABLE: &str = "ledger";
pub(crate) const META_TABLE: &str = "meta";
const SEQ_KEY: &str = "next_seq";

/// One unconfirmed local intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The intent.
    pub change: PendingChange,
    /// Collection of the target entity.
    pub collection: Collection,
    /// Position of the first intent recorded for this entity.
    pub seq: u64,
    /// Identity of this particular recording; changes on every record.
    pub change_id: u64,
    /// When the current intent was recorded, milliseconds since the epoch.
    pub recorded_at: u64,
}

impl LedgerEntry {
    /// Returns the target entity's key.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.collection, self.change.entity_id())
    }
}

/// What `record` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The entry was inserted or replaced.
    Recorded {
        /// The entry now in the ledger.
        entry: LedgerEntry,
        /// `change_id` of the entry it replaced.
        replaced: Option<u64>,
    },
    /// A create that never reached the server was cancelled by a delete.
    /// Nothing remains in the ledger for the entity.
    Collapsed {
        /// `change_id` of the discarded create.
        removed: u64,
    },
}

/// How `record` treats an existing create.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordPolicy {
    pub collapse_unsynced_deletes: bool,
    /// `change_id` currently being shipped for this entity, if any.
    pub in_flight: Option<u64>,
}

/// The authoritative record of what still needs to reach the server.
///
/// At most one entry exists per entity. Recording a new intent for an
/// entity replaces the old one but keeps its place in line, so replay
/// order follows the *first* time the entity was touched.
///
/// Intents collapse as follows:
///
/// | existing | new              | result                         |
/// |----------|------------------|--------------------------------|
/// | none     | any              | new                            |
/// | Create   | Update / Archive | Create                         |
/// | Create   | Delete           | removed, unless in flight      |
/// | other    | any              | new                            |
pub struct PendingLedger {
    log: Arc<KvLog>,
    next_seq: AtomicU64,
    collapse_unsynced_deletes: bool,
}

impl PendingLedger {
    /// Opens the ledger stored in `log`.
    pub fn open(log: Arc<KvLog>) -> SyncResult<Self> {
        let stored = match log.get(META_TABLE, SEQ_KEY) {
            Some(bytes) => from_cbor::<u64>(&bytes)?,
            None => 1,
        };
        Ok(Self {
            log,
            next_seq: AtomicU64::new(stored.max(1)),
            collapse_unsynced_deletes: true,
        })
    }

    /// Chooses whether a delete cancels a create the server never saw.
    pub fn with_collapse_unsynced_deletes(mut self, collapse: bool) -> Self {
        self.collapse_unsynced_deletes = collapse;
        self
    }

    /// Returns whether a delete cancels a create the server never saw.
    pub fn collapses_unsynced_deletes(&self) -> bool {
        self.collapse_unsynced_deletes
    }

    /// Records an intent, committing immediately.
    pub fn record(&self, collection: Collection, change: PendingChange) -> SyncResult<RecordOutcome> {
        let mut batch = WriteBatch::new();
        let policy = RecordPolicy {
            collapse_unsynced_deletes: self.collapse_unsynced_deletes,
            in_flight: None,
        };
        let outcome = self.stage_record(&mut batch, collection, change, policy)?;
        self.log.write(batch)?;
        Ok(outcome)
    }

    /// Returns the entry for an entity.
    pub fn get(&self, key: &EntityKey) -> SyncResult<Option<LedgerEntry>> {
        match self.log.get(LEDGER_TABLE, &key.to_string()) {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes the entry for an entity. Returns false if there was none.
    pub fn remove(&self, key: &EntityKey) -> SyncResult<bool> {
        if self.get(key)?.is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        Self::stage_remove(&mut batch, key);
        self.log.write(batch)?;
        Ok(true)
    }

    /// Returns every entry, oldest first.
    pub fn list(&self) -> SyncResult<Vec<LedgerEntry>> {
        let mut entries = self
            .log
            .scan(LEDGER_TABLE)
            .into_iter()
            .map(|(_, bytes)| Ok(from_cbor::<LedgerEntry>(&bytes)?))
            .collect::<SyncResult<Vec<_>>>()?;
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Returns the ids with a pending intent in one collection.
    pub fn pending_ids(&self, collection: Collection) -> SyncResult<HashSet<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.collection == collection)
            .map(|e| e.change.entity_id().to_string())
            .collect())
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.log.row_count(LEDGER_TABLE)
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry.
    pub fn clear(&self) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        Self::stage_clear(&mut batch);
        self.log.write(batch)?;
        Ok(())
    }

    /// Stages an intent, applying the collapse rules.
    pub(crate) fn stage_record(
        &self,
        batch: &mut WriteBatch,
        collection: Collection,
        change: PendingChange,
        policy: RecordPolicy,
    ) -> SyncResult<RecordOutcome> {
        let key = EntityKey::new(collection, change.entity_id());
        let previous = self.get(&key)?;

        let (change, seq, replaced) = match previous {
            None => (change, self.allocate(batch)?, None),
            Some(prev) => {
                let prev_in_flight = policy.in_flight == Some(prev.change_id);
                match (prev.change.kind(), change.kind()) {
                    (ChangeKind::Create, ChangeKind::Update | ChangeKind::Archive) => {
                        (prev.change.clone(), prev.seq, Some(prev.change_id))
                    }
                    (ChangeKind::Create, ChangeKind::Delete)
                        if policy.collapse_unsynced_deletes && !prev_in_flight =>
                    {
                        Self::stage_remove(batch, &key);
                        debug!(entity = %key, "create and delete collapsed before sync");
                        return Ok(RecordOutcome::Collapsed {
                            removed: prev.change_id,
                        });
                    }
                    _ => (change, prev.seq, Some(prev.change_id)),
                }
            }
        };

        let entry = LedgerEntry {
            change,
            collection,
            seq,
            change_id: self.allocate(batch)?,
            recorded_at: now_millis(),
        };
        Self::stage_put(batch, &entry)?;
        Ok(RecordOutcome::Recorded { entry, replaced })
    }

    pub(crate) fn stage_put(batch: &mut WriteBatch, entry: &LedgerEntry) -> SyncResult<()> {
        batch.put(LEDGER_TABLE, entry.key().to_string(), to_cbor(entry)?);
        Ok(())
    }

    pub(crate) fn stage_remove(batch: &mut WriteBatch, key: &EntityKey) {
        batch.delete(LEDGER_TABLE, key.to_string());
    }

    /// Stages removal of every ledger entry into `batch`.
    pub fn stage_clear(batch: &mut WriteBatch) {
        batch.clear_table(LEDGER_TABLE);
    }

    /// Hands out the next sequence number and persists the counter with
    /// the batch that uses it.
    fn allocate(&self, batch: &mut WriteBatch) -> SyncResult<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        batch.put(META_TABLE, SEQ_KEY, to_cbor(&(seq + 1))?);
        Ok(seq)
    }
}

impl std::fmt::Debug for PendingLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLedger")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
