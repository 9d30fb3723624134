//! Retry queue.

use crate::config::RetryConfig;
use crate::error::SyncResult;
use crate::ledger::LedgerEntry;
use crate::remote::RemoteError;
use crate::status::FailureKind;
use crate::store::now_millis;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_storage::{KvLog, WriteBatch};
use tally_sync_protocol::{from_cbor, to_cbor, ChangeKind, Entity, EntityKey};

pub(crate) const QUEUE_TABLE: &str = "queue";

/// Whether a queue item will be shipped on the next drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Shipped on the next drain.
    Waiting,
    /// Skipped until retried or re-recorded.
    Failed {
        /// Why the item stopped.
        kind: FailureKind,
        /// Human-readable reason.
        reason: String,
    },
}

/// Execution record of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// `change_id` of the ledger entry this item ships.
    pub change_id: u64,
    /// Target entity.
    pub key: EntityKey,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Entity value when the change was recorded.
    pub payload: Option<Entity>,
    /// When the item was created, milliseconds since the epoch.
    pub created_at: u64,
    /// Failed shipping attempts so far.
    pub attempts: u32,
    /// Current status.
    pub status: ItemStatus,
}

impl QueueItem {
    /// Returns true if the item is parked as failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.status, ItemStatus::Failed { .. })
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items sent to the server.
    pub attempted: usize,
    /// Items the server confirmed.
    pub confirmed: usize,
    /// Items that failed transiently and stay queued.
    pub retried: usize,
    /// Items marked failed during this pass.
    pub failed: usize,
    /// Items dropped because their entity is gone on the server.
    pub dropped: usize,
    /// Failed items left alone.
    pub skipped: usize,
    /// Items waiting for their parent challenge to be created.
    pub deferred: usize,
    /// Ledger entries left after the pass.
    pub remaining: usize,
    /// True if another drain was already running and this call did nothing.
    pub coalesced: bool,
}

impl DrainReport {
    /// The report of a drain request merged into a running one.
    pub fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }
}

/// How a failed shipment is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Keep the item, with one more attempt counted.
    Retry(QueueItem),
    /// Park the item as failed.
    Park(QueueItem),
    /// Drop the change together with its local entity.
    Drop,
    /// Stop the drain and ask for credentials.
    Reauthenticate,
}

/// Replays ledger entries against the server with bounded retries.
///
/// Items are keyed by `change_id`, so replacing a ledger entry orphans
/// the old item, which the caller removes in the same batch.
pub struct RetryQueue {
    log: Arc<KvLog>,
    retry: RetryConfig,
}

impl RetryQueue {
    /// Creates a queue over `log`.
    pub fn new(log: Arc<KvLog>, mut retry: RetryConfig) -> Self {
        retry.max_attempts = retry.max_attempts.max(1);
        Self { log, retry }
    }

    /// Wraps a ledger entry into a fresh item and commits it.
    pub fn enqueue(&self, entry: &LedgerEntry, payload: Option<Entity>) -> SyncResult<QueueItem> {
        let mut batch = WriteBatch::new();
        let item = Self::stage_enqueue(&mut batch, entry, payload)?;
        self.log.write(batch)?;
        Ok(item)
    }

    /// Looks up an item.
    pub fn get(&self, change_id: u64) -> SyncResult<Option<QueueItem>> {
        match self.log.get(QUEUE_TABLE, &item_key(change_id)) {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns every item, ordered by `change_id`.
    pub fn list(&self) -> SyncResult<Vec<QueueItem>> {
        self.log
            .scan(QUEUE_TABLE)
            .into_iter()
            .map(|(_, bytes)| Ok(from_cbor(&bytes)?))
            .collect()
    }

    /// Returns the items parked as failed.
    pub fn failed_items(&self) -> SyncResult<Vec<QueueItem>> {
        Ok(self.list()?.into_iter().filter(QueueItem::is_failed).collect())
    }

    /// Puts every failed item back in line with a fresh retry budget.
    ///
    /// Returns the number of items reset.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let mut batch = WriteBatch::new();
        let mut count = 0;
        for mut item in self.failed_items()? {
            item.status = ItemStatus::Waiting;
            item.attempts = 0;
            Self::stage_put(&mut batch, &item)?;
            count += 1;
        }
        self.log.write(batch)?;
        Ok(count)
    }

    /// Removes every item.
    pub fn clear(&self) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        Self::stage_clear(&mut batch);
        self.log.write(batch)?;
        Ok(())
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.log.row_count(QUEUE_TABLE)
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the attempt budget per item.
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts
    }

    /// Decides what a failed shipment means for its item.
    pub(crate) fn judge(&self, mut item: QueueItem, error: &RemoteError) -> Verdict {
        match error {
            RemoteError::Unauthorized(_) => Verdict::Reauthenticate,
            RemoteError::NotFound(_) | RemoteError::Gone(_) => Verdict::Drop,
            RemoteError::Rejected(message) => {
                item.attempts = item.attempts.saturating_add(1);
                item.status = ItemStatus::Failed {
                    kind: FailureKind::Validation,
                    reason: message.clone(),
                };
                Verdict::Park(item)
            }
            RemoteError::Network(_) | RemoteError::Server { .. } => {
                item.attempts = item.attempts.saturating_add(1);
                if self.retry.is_exhausted(item.attempts) {
                    item.status = ItemStatus::Failed {
                        kind: FailureKind::RetriesExhausted,
                        reason: format!("gave up after {} attempts: {error}", item.attempts),
                    };
                    Verdict::Park(item)
                } else {
                    Verdict::Retry(item)
                }
            }
        }
    }

    pub(crate) fn stage_enqueue(
        batch: &mut WriteBatch,
        entry: &LedgerEntry,
        payload: Option<Entity>,
    ) -> SyncResult<QueueItem> {
        let item = QueueItem {
            change_id: entry.change_id,
            key: entry.key(),
            kind: entry.change.kind(),
            payload,
            created_at: now_millis(),
            attempts: 0,
            status: ItemStatus::Waiting,
        };
        Self::stage_put(batch, &item)?;
        Ok(item)
    }

    pub(crate) fn stage_put(batch: &mut WriteBatch, item: &QueueItem) -> SyncResult<()> {
        batch.put(QUEUE_TABLE, item_key(item.change_id), to_cbor(item)?);
        Ok(())
    }

    pub(crate) fn stage_remove(batch: &mut WriteBatch, change_id: u64) {
        batch.delete(QUEUE_TABLE, item_key(change_id));
    }

    /// Stages removal of every queue item into `batch`.
    pub fn stage_clear(batch: &mut WriteBatch) {
        batch.clear_table(QUEUE_TABLE);
    }
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("len", &self.len())
            .field("max_attempts", &self.retry.max_attempts)
            .finish()
    }
}

// Zero-padded so table order matches numeric order.
fn item_key(change_id: u64) -> String {
    format!("{change_id:020}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_storage::InMemoryBackend;
    use tally_sync_protocol::{Collection, PendingChange};

    fn queue(max_attempts: u32) -> RetryQueue {
        let log = KvLog::open(Box::new(InMemoryBackend::new())).unwrap();
        RetryQueue::new(Arc::new(log), RetryConfig::new(max_attempts))
    }

    fn entry(change_id: u64) -> LedgerEntry {
        LedgerEntry {
            change: PendingChange::Update(format!("c-{change_id}")),
            collection: Collection::Challenges,
            seq: change_id,
            change_id,
            recorded_at: 0,
        }
    }

    #[test]
    fn enqueue_starts_at_zero_attempts() {
        let queue = queue(3);
        let item = queue.enqueue(&entry(7), None).unwrap();
        assert_eq!(item.attempts, 0);
        assert_eq!(item.status, ItemStatus::Waiting);
        assert_eq!(item.kind, ChangeKind::Update);
        assert_eq!(queue.get(7).unwrap(), Some(item));
    }

    #[test]
    fn list_orders_numerically() {
        let queue = queue(3);
        queue.enqueue(&entry(10), None).unwrap();
        queue.enqueue(&entry(9), None).unwrap();
        let ids: Vec<_> = queue.list().unwrap().iter().map(|i| i.change_id).collect();
        assert_eq!(ids, vec![9, 10]);
    }

    #[test]
    fn clear_drops_every_item() {
        let queue = queue(3);
        queue.enqueue(&entry(1), None).unwrap();
        queue.enqueue(&entry(2), None).unwrap();
        queue.clear().unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.get(1).unwrap(), None);
    }

    #[test]
    fn transient_errors_count_until_budget() {
        let queue = queue(2);
        let item = queue.enqueue(&entry(1), None).unwrap();

        let Verdict::Retry(item) = queue.judge(item, &RemoteError::Network("down".into())) else {
            panic!("first failure should retry");
        };
        assert_eq!(item.attempts, 1);

        let verdict = queue.judge(
            item,
            &RemoteError::Server {
                status: 503,
                message: "busy".into(),
            },
        );
        let Verdict::Park(item) = verdict else {
            panic!("budget exhausted should park");
        };
        assert_eq!(item.attempts, 2);
        assert!(matches!(
            item.status,
            ItemStatus::Failed {
                kind: FailureKind::RetriesExhausted,
                ref reason
            } if reason.starts_with("gave up after 2 attempts")
        ));
    }

    #[test]
    fn terminal_errors() {
        let queue = queue(5);
        let item = queue.enqueue(&entry(1), None).unwrap();

        assert!(matches!(
            queue.judge(item.clone(), &RemoteError::Rejected("name too long".into())),
            Verdict::Park(QueueItem {
                status: ItemStatus::Failed {
                    kind: FailureKind::Validation,
                    ..
                },
                ..
            })
        ));
        assert_eq!(
            queue.judge(item.clone(), &RemoteError::Gone("deleted".into())),
            Verdict::Drop
        );
        assert_eq!(
            queue.judge(item, &RemoteError::Unauthorized("expired".into())),
            Verdict::Reauthenticate
        );
    }

    #[test]
    fn retry_failed_resets_items() {
        let queue = queue(1);
        let item = queue.enqueue(&entry(1), None).unwrap();
        let Verdict::Park(item) = queue.judge(item, &RemoteError::Network("down".into())) else {
            panic!("budget of one should park");
        };
        let mut batch = WriteBatch::new();
        RetryQueue::stage_put(&mut batch, &item).unwrap();
        queue.log.write(batch).unwrap();
        assert_eq!(queue.failed_items().unwrap().len(), 1);

        assert_eq!(queue.retry_failed().unwrap(), 1);
        let item = queue.get(1).unwrap().unwrap();
        assert_eq!(item.attempts, 0);
        assert_eq!(item.status, ItemStatus::Waiting);
        assert!(queue.failed_items().unwrap().is_empty());
    }

    #[test]
    fn coalesced_report() {
        let report = DrainReport::coalesced();
        assert!(report.coalesced);
        assert_eq!(report.attempted, 0);
    }
}
