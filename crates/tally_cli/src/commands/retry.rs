//! Retry-failed command implementation.

use super::{open_pending, open_store};
use std::path::Path;
use tracing::info;

/// Runs the retry-failed command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let count = retry_failed(path)?;
    println!("{count} failed item(s) requeued");
    Ok(())
}

/// Resets failed queue items. Returns how many were reset.
pub fn retry_failed(path: &Path) -> Result<usize, Box<dyn std::error::Error>> {
    let log = open_store(path)?;
    let (_, queue) = open_pending(&log)?;
    let count = queue.retry_failed()?;
    info!(count, path = %path.display(), "failed items requeued");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_store;
    use tempfile::TempDir;

    #[test]
    fn nothing_to_retry() {
        let dir = TempDir::new().unwrap();
        let path = sample_store(&dir);
        assert_eq!(retry_failed(&path).unwrap(), 0);
    }
}
