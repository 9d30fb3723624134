//! Ledger command implementation.

use super::{open_pending, open_store};
use crate::Format;
use serde::Serialize;
use std::path::Path;

/// One pending change, in replay order.
#[derive(Debug, Serialize)]
pub struct LedgerRow {
    /// Replay position.
    pub seq: u64,
    /// Identity of the current recording.
    pub change_id: u64,
    /// Kind of change.
    pub kind: String,
    /// Target entity.
    pub entity: String,
    /// When the change was recorded, milliseconds since the epoch.
    pub recorded_at: u64,
    /// Failed attempts of the matching queue item.
    pub attempts: Option<u32>,
}

/// Runs the ledger command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let rows = rows(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            if rows.is_empty() {
                println!("No pending changes");
            }
            for row in &rows {
                let attempts = row
                    .attempts
                    .map_or_else(|| "-".to_string(), |a| a.to_string());
                println!(
                    "{:>6}  {:<8} {:<48} attempts={}",
                    row.seq, row.kind, row.entity, attempts
                );
            }
        }
    }
    Ok(())
}

/// Lists the ledger with queue attempts.
pub fn rows(path: &Path) -> Result<Vec<LedgerRow>, Box<dyn std::error::Error>> {
    let log = open_store(path)?;
    let (ledger, queue) = open_pending(&log)?;

    let mut rows = Vec::new();
    for entry in ledger.list()? {
        let attempts = queue.get(entry.change_id)?.map(|item| item.attempts);
        rows.push(LedgerRow {
            seq: entry.seq,
            change_id: entry.change_id,
            kind: entry.change.kind().to_string(),
            entity: entry.key().to_string(),
            recorded_at: entry.recorded_at,
            attempts,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_store;
    use tempfile::TempDir;

    #[test]
    fn rows_are_in_replay_order() {
        let dir = TempDir::new().unwrap();
        let path = sample_store(&dir);

        let rows = rows(&path).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(rows[0].entity.starts_with("challenges/"));
        assert!(rows.iter().all(|r| r.kind == "create"));
        assert!(rows.iter().all(|r| r.attempts == Some(0)));
    }
}
