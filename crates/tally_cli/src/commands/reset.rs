//! Reset command implementation.

use super::open_store;
use std::path::Path;
use std::sync::Arc;
use tally_storage::WriteBatch;
use tally_sync_engine::{LocalStore, PendingLedger, RetryQueue};
use tracing::info;

/// Runs the reset command.
pub fn run(path: &Path, keep_entities: bool) -> Result<(), Box<dyn std::error::Error>> {
    let discarded = reset(path, keep_entities)?;
    println!("Discarded {discarded} pending change(s)");
    if !keep_entities {
        println!("Cleared all local entities");
    }
    Ok(())
}

/// Clears the queue, the ledger and, unless kept, the entities in one
/// batch.
///
/// Returns the number of pending changes discarded.
pub fn reset(path: &Path, keep_entities: bool) -> Result<usize, Box<dyn std::error::Error>> {
    let log = open_store(path)?;
    let discarded = PendingLedger::open(Arc::clone(&log))?.len();

    let mut batch = WriteBatch::new();
    RetryQueue::stage_clear(&mut batch);
    PendingLedger::stage_clear(&mut batch);
    if !keep_entities {
        LocalStore::stage_clear(&mut batch);
    }
    log.write(batch)?;
    log.compact()?;

    info!(discarded, keep_entities, "store reset");
    Ok(discarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::inspect::inspect;
    use crate::commands::testing::sample_store;
    use tempfile::TempDir;

    #[test]
    fn reset_keeping_entities() {
        let dir = TempDir::new().unwrap();
        let path = sample_store(&dir);

        assert_eq!(reset(&path, true).unwrap(), 4);
        let result = inspect(&path).unwrap();
        assert_eq!(result.ledger_size, 0);
        assert!(result.queue.is_empty());
        assert_eq!(result.collections[0].count, 1);
        assert_eq!(result.status, "Synced");
    }

    #[test]
    fn full_reset() {
        let dir = TempDir::new().unwrap();
        let path = sample_store(&dir);

        assert_eq!(reset(&path, false).unwrap(), 4);
        let result = inspect(&path).unwrap();
        assert!(result.collections.iter().all(|c| c.count == 0));
        assert_eq!(result.ledger_size, 0);
        assert!(result.queue.is_empty());
        // The mode survives a reset.
        assert_eq!(result.mode.as_deref(), Some("synced"));
    }
}
