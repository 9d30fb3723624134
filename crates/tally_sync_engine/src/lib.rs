//! # Tally Sync Engine
//!
//! Local-first synchronization for Tally clients.
//!
//! This crate provides:
//! - [`LocalStore`], the durable cache of challenges, entries and follows
//! - [`PendingLedger`], one unconfirmed intent per entity
//! - [`RetryQueue`], bounded replay of ledger entries against the server
//! - [`merge`], reconciliation of a server snapshot with local state
//! - [`SyncState`], the derived status shown to the user
//! - [`SyncCoordinator`], the single writer that ties them together
//!
//! ## Architecture
//!
//! Every user action goes through the coordinator, which validates it and
//! writes the new value, the ledger entry and the queue item in one
//! storage batch. The server is reached only by draining the queue and by
//! refreshing snapshots:
//!
//! 1. Drain ships ledger entries oldest first and shrinks the ledger as
//!    the server confirms them
//! 2. Refresh fetches the server's state and merges it: pending local
//!    intent wins, everything else follows the server
//!
//! ## Key Invariants
//!
//! - At most one ledger entry per entity
//! - A pending entity is never overwritten or dropped by a merge
//! - A merge is committed as a single batch or not at all
//! - Only one drain runs at a time
//! - A failed storage write never loses a ledger entry

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod error;
mod ledger;
mod queue;
mod reconcile;
mod remote;
mod status;
mod store;

pub use config::{RetryConfig, SyncConfig};
pub use coordinator::{
    AppMode, Backend, NewChallenge, NewEntry, RefreshReport, SyncCoordinator, SyncStats,
};
pub use error::{SyncError, SyncResult};
pub use ledger::{LedgerEntry, PendingLedger, RecordOutcome};
pub use queue::{DrainReport, ItemStatus, QueueItem, RetryQueue};
pub use reconcile::{merge, MergePlan};
pub use remote::{MockRemote, RemoteApi, RemoteError, RemoteResult};
pub use status::{compute_state, Failure, FailureKind, StatusInputs, SyncState};
pub use store::LocalStore;
