//! Derived sync status.
//!
//! The status is never stored. It is recomputed from a handful of inputs
//! every time it is read, so it cannot drift from the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;

/// User-facing sync status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing pending, nothing failing.
    Synced,
    /// Local changes waiting for the server.
    Pending(usize),
    /// A drain is running.
    Syncing,
    /// The last sync attempt ended in a terminal failure.
    Failed(String),
    /// The server is unreachable; changes stay local.
    Offline,
}

impl SyncState {
    /// Returns true if local changes still need to reach the server.
    pub fn has_pending_changes(&self) -> bool {
        matches!(self, SyncState::Pending(_) | SyncState::Failed(_))
    }

    /// Returns true if offline.
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncState::Offline)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Synced => f.write_str("Synced"),
            SyncState::Pending(n) => write!(f, "{n} pending"),
            SyncState::Syncing => f.write_str("Syncing"),
            SyncState::Failed(reason) => write!(f, "Sync failed: {reason}"),
            SyncState::Offline => f.write_str("Offline"),
        }
    }
}

/// Category of a cached failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Credentials are missing or were refused.
    AuthRequired,
    /// The server rejected a payload.
    Validation,
    /// An item used up its retry budget.
    RetriesExhausted,
    /// Local persistence failed.
    Storage,
    /// A snapshot fetch failed for a reason other than connectivity.
    Fetch,
}

impl FailureKind {
    /// Returns true if only user action can clear the failure.
    pub fn needs_user(self) -> bool {
        matches!(self, FailureKind::AuthRequired | FailureKind::Validation)
    }
}

/// The last terminal failure, summarized for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Category.
    pub kind: FailureKind,
    /// Human-readable reason.
    pub message: String,
}

impl Failure {
    /// Creates a failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Everything the status depends on.
#[derive(Debug, Clone, Copy)]
pub struct StatusInputs<'a> {
    /// Number of ledger entries.
    pub ledger_size: usize,
    /// Whether a drain is running.
    pub draining: bool,
    /// Result of the last network probe.
    pub online: bool,
    /// Cached terminal failure.
    pub last_failure: Option<&'a Failure>,
}

/// Computes the status.
///
/// Precedence: a running drain, then connectivity, then a cached
/// failure, then the ledger size.
pub fn compute_state(inputs: StatusInputs<'_>) -> SyncState {
    if inputs.draining {
        return SyncState::Syncing;
    }
    if !inputs.online {
        return SyncState::Offline;
    }
    if let Some(failure) = inputs.last_failure {
        return SyncState::Failed(failure.message.clone());
    }
    match inputs.ledger_size {
        0 => SyncState::Synced,
        n => SyncState::Pending(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(ledger_size: usize) -> StatusInputs<'static> {
        StatusInputs {
            ledger_size,
            draining: false,
            online: true,
            last_failure: None,
        }
    }

    #[test]
    fn pending_count_and_synced() {
        assert_eq!(compute_state(inputs(3)), SyncState::Pending(3));
        assert_eq!(compute_state(inputs(0)), SyncState::Synced);
    }

    #[test]
    fn draining_wins() {
        let failure = Failure::new(FailureKind::Validation, "bad name");
        let state = compute_state(StatusInputs {
            draining: true,
            online: false,
            last_failure: Some(&failure),
            ..inputs(2)
        });
        assert_eq!(state, SyncState::Syncing);
    }

    #[test]
    fn offline_before_failure() {
        let failure = Failure::new(FailureKind::Fetch, "boom");
        let state = compute_state(StatusInputs {
            online: false,
            last_failure: Some(&failure),
            ..inputs(1)
        });
        assert_eq!(state, SyncState::Offline);
    }

    #[test]
    fn failure_reported_with_reason() {
        let failure = Failure::new(FailureKind::RetriesExhausted, "gave up");
        let state = compute_state(StatusInputs {
            last_failure: Some(&failure),
            ..inputs(4)
        });
        assert_eq!(state, SyncState::Failed("gave up".into()));
        assert!(state.has_pending_changes());
        assert_eq!(state.to_string(), "Sync failed: gave up");
    }

    #[test]
    fn regaining_network_shows_ledger() {
        let offline = compute_state(StatusInputs {
            online: false,
            ..inputs(2)
        });
        assert!(offline.is_offline());
        assert_eq!(compute_state(inputs(2)), SyncState::Pending(2));
    }
}
