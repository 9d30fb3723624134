//! CLI command implementations.

pub mod compact;
pub mod inspect;
pub mod ledger;
pub mod reset;
pub mod retry;

use std::path::Path;
use std::sync::Arc;
use tally_storage::{FileBackend, KvLog};
use tally_sync_engine::{PendingLedger, RetryConfig, RetryQueue};

/// Opens an existing store. Fails if the app holds it open.
pub fn open_store(path: &Path) -> Result<Arc<KvLog>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }
    let backend = FileBackend::open(path)?;
    Ok(Arc::new(KvLog::open(Box::new(backend))?))
}

/// Opens the ledger and queue of a store.
pub fn open_pending(
    log: &Arc<KvLog>,
) -> Result<(PendingLedger, RetryQueue), Box<dyn std::error::Error>> {
    let ledger = PendingLedger::open(Arc::clone(log))?;
    let queue = RetryQueue::new(Arc::clone(log), RetryConfig::default());
    Ok((ledger, queue))
}
