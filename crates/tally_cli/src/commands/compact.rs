//! Compact command implementation.

use super::open_store;
use std::path::Path;

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction.
    pub bytes_after: u64,
}

/// Runs the compact command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting store at {:?}", path);
    let stats = compact(path)?;

    println!("  Size before: {} bytes", stats.bytes_before);
    println!("  Size after:  {} bytes", stats.bytes_after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        stats.bytes_before.saturating_sub(stats.bytes_after),
        if stats.bytes_before > 0 {
            (stats.bytes_before.saturating_sub(stats.bytes_after) as f64
                / stats.bytes_before as f64)
                * 100.0
        } else {
            0.0
        }
    );
    Ok(())
}

/// Rewrites the store as a single snapshot.
pub fn compact(path: &Path) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let log = open_store(path)?;
    let bytes_before = log.size_bytes()?;
    log.compact()?;
    Ok(CompactStats {
        bytes_before,
        bytes_after: log.size_bytes()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::inspect::inspect;
    use crate::commands::testing::sample_store;
    use tempfile::TempDir;

    #[test]
    fn compaction_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = sample_store(&dir);
        let before = inspect(&path).unwrap();

        let stats = compact(&path).unwrap();
        assert!(stats.bytes_after <= stats.bytes_before);

        let after = inspect(&path).unwrap();
        assert_eq!(after.ledger_size, before.ledger_size);
        assert_eq!(after.queue.len(), before.queue.len());
    }
}
