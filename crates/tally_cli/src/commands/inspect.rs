//! Inspect command implementation.

use super::{open_pending, open_store};
use crate::Format;
use serde::Serialize;
use std::path::Path;
use tally_sync_engine::{
    compute_state, AppMode, Failure, ItemStatus, LocalStore, StatusInputs,
};
use tally_sync_protocol::Collection;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Log size in bytes.
    pub size_bytes: u64,
    /// Backend mode, if one was ever recorded.
    pub mode: Option<String>,
    /// Entities per collection.
    pub collections: Vec<CollectionStats>,
    /// Pending changes.
    pub ledger_size: usize,
    /// Queue items.
    pub queue: Vec<QueueSummary>,
    /// Sync status as the app would show it offline.
    pub status: String,
}

/// Entity count of one collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Number of entities.
    pub count: usize,
}

/// One queue item.
#[derive(Debug, Serialize)]
pub struct QueueSummary {
    /// Ledger change id.
    pub change_id: u64,
    /// Target entity.
    pub entity: String,
    /// Kind of change.
    pub kind: String,
    /// Failed attempts.
    pub attempts: u32,
    /// `waiting`, or the failure reason.
    pub status: String,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

/// Gathers the inspection result.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let log = open_store(path)?;
    let (ledger, queue) = open_pending(&log)?;
    let store = LocalStore::new(log.clone());

    let collections = Collection::ALL
        .into_iter()
        .map(|c| CollectionStats {
            name: c.to_string(),
            count: store.count(c),
        })
        .collect();

    let items = queue.list()?;
    let first_failure = items.iter().find_map(|item| match &item.status {
        ItemStatus::Failed { kind, reason } => Some(Failure::new(*kind, reason.clone())),
        ItemStatus::Waiting => None,
    });
    let status = compute_state(StatusInputs {
        ledger_size: ledger.len(),
        draining: false,
        online: true,
        last_failure: first_failure.as_ref(),
    });

    let mode = AppMode::load(&log)?.map(|m| match m {
        AppMode::LocalOnly => "local-only".to_string(),
        AppMode::Synced => "synced".to_string(),
    });

    Ok(InspectResult {
        path: path.display().to_string(),
        size_bytes: log.size_bytes()?,
        mode,
        collections,
        ledger_size: ledger.len(),
        queue: items
            .into_iter()
            .map(|item| QueueSummary {
                change_id: item.change_id,
                entity: item.key.to_string(),
                kind: item.kind.to_string(),
                attempts: item.attempts,
                status: match item.status {
                    ItemStatus::Waiting => "waiting".to_string(),
                    ItemStatus::Failed { reason, .. } => format!("failed: {reason}"),
                },
            })
            .collect(),
        status: status.to_string(),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Tally Store: {}", result.path);
    println!("  Size:   {} bytes", result.size_bytes);
    println!(
        "  Mode:   {}",
        result.mode.as_deref().unwrap_or("(not recorded)")
    );
    println!("  Status: {}", result.status);
    println!();
    println!("Collections:");
    for c in &result.collections {
        println!("  {:<12} {}", c.name, c.count);
    }
    println!();
    println!("Pending changes: {}", result.ledger_size);
    if !result.queue.is_empty() {
        println!("Queue:");
        for item in &result.queue {
            println!(
                "  #{:<6} {:<8} {:<48} attempts={} {}",
                item.change_id, item.kind, item.entity, item.attempts, item.status
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_store;
    use tempfile::TempDir;

    #[test]
    fn inspect_sample_store() {
        let dir = TempDir::new().unwrap();
        let path = sample_store(&dir);

        let result = inspect(&path).unwrap();
        assert_eq!(result.mode.as_deref(), Some("synced"));
        assert_eq!(result.ledger_size, 4);
        assert_eq!(result.queue.len(), 4);
        assert_eq!(result.status, "4 pending");
        let counts: Vec<_> = result.collections.iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![1, 2, 1]);
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(inspect(&dir.path().join("absent.log")).is_err());
    }
}
