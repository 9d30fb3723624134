//! Test fixtures and client helpers.
//!
//! Provides valid entity values and clients wired to a [`FakeServer`].

use crate::fake_server::FakeServer;
use std::sync::Arc;
use tally_storage::{FileBackend, InMemoryBackend, KvLog, StorageBackend};
use tally_sync_engine::{Backend, SyncConfig, SyncCoordinator};
use tally_sync_protocol::{Challenge, Entry, Follow, Timeframe, Visibility};
use tempfile::TempDir;

/// Token every test client signs in with.
pub const TOKEN: &str = "test-token";

/// A valid year-long challenge.
pub fn challenge(id: &str) -> Challenge {
    Challenge {
        id: id.into(),
        name: format!("Challenge {id}"),
        target: 100,
        timeframe: Timeframe::year(),
        color: "#4a90e2".into(),
        icon: "flag".into(),
        visibility: Visibility::Public,
        archived: false,
        created_at: 1,
    }
}

/// A valid entry of `count` 1.
pub fn entry(id: &str, challenge_id: &str) -> Entry {
    Entry {
        id: id.into(),
        challenge_id: challenge_id.into(),
        date: "2026-06-01".into(),
        count: 1,
        note: None,
        sets: Vec::new(),
        feeling: None,
        created_at: 1,
    }
}

/// A follow.
pub fn follow(id: &str, challenge_id: &str) -> Follow {
    Follow {
        id: id.into(),
        challenge_id: challenge_id.into(),
        followed_at: 1,
        created_at: 1,
    }
}

/// A coordinator signed in to a [`FakeServer`].
///
/// File-backed clients can be restarted; the store outlives the
/// coordinator until the client is dropped.
pub struct TestClient {
    /// The coordinator under test.
    pub coordinator: Arc<SyncCoordinator<FakeServer>>,
    /// The server it talks to.
    pub server: Arc<FakeServer>,
    config: SyncConfig,
    dir: Option<TempDir>,
}

impl TestClient {
    /// Creates a client over an in-memory store.
    pub fn memory(server: Arc<FakeServer>) -> Self {
        let config = SyncConfig::default();
        let coordinator = open(
            Box::new(InMemoryBackend::new()),
            &server,
            config.clone(),
        );
        Self {
            coordinator,
            server,
            config,
            dir: None,
        }
    }

    /// Creates a client over a store in a temporary directory.
    pub fn file(server: Arc<FakeServer>) -> Self {
        Self::file_with_config(server, SyncConfig::default())
    }

    /// Creates a file-backed client with a custom configuration.
    pub fn file_with_config(server: Arc<FakeServer>, config: SyncConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let coordinator = open(file_backend(&dir), &server, config.clone());
        Self {
            coordinator,
            server,
            config,
            dir: Some(dir),
        }
    }

    /// Drops the coordinator and opens a new one on the same store, as an
    /// app restart would.
    ///
    /// # Panics
    ///
    /// Panics for in-memory clients, or if the coordinator is still
    /// shared elsewhere.
    pub fn restart(self) -> Self {
        let Self {
            coordinator,
            server,
            config,
            dir,
        } = self;
        let dir = dir.expect("Only file-backed clients can restart");
        assert_eq!(
            Arc::strong_count(&coordinator),
            1,
            "Coordinator still shared"
        );
        drop(coordinator);

        let coordinator = open(file_backend(&dir), &server, config.clone());
        Self {
            coordinator,
            server,
            config,
            dir: Some(dir),
        }
    }
}

impl std::ops::Deref for TestClient {
    type Target = SyncCoordinator<FakeServer>;

    fn deref(&self) -> &Self::Target {
        &self.coordinator
    }
}

fn file_backend(dir: &TempDir) -> Box<dyn StorageBackend> {
    let backend = FileBackend::open_with_create_dirs(&dir.path().join("tally.log"))
        .expect("Failed to open file backend");
    Box::new(backend)
}

fn open(
    backend: Box<dyn StorageBackend>,
    server: &Arc<FakeServer>,
    config: SyncConfig,
) -> Arc<SyncCoordinator<FakeServer>> {
    let log = KvLog::open(backend).expect("Failed to open log");
    let coordinator = SyncCoordinator::open(
        log,
        config,
        Backend::Synced {
            remote: Arc::clone(server),
            credentials: Some(TOKEN.into()),
        },
    )
    .expect("Failed to open coordinator");
    Arc::new(coordinator)
}

/// Asserts that nothing is pending and the client mirrors the server.
///
/// # Panics
///
/// Panics with the first difference found.
pub fn assert_converged(client: &TestClient) {
    let pending = client.ledger().list().expect("Failed to list ledger");
    assert!(pending.is_empty(), "pending changes left: {pending:?}");

    let mut local = client.challenges().expect("Failed to list challenges");
    let mut remote = client.server.challenges();
    local.sort_by(|a, b| a.id.cmp(&b.id));
    remote.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(local, remote, "challenges differ");

    let mut local = client
        .store()
        .list_all::<Entry>()
        .expect("Failed to list entries");
    let mut remote = client.server.entries();
    local.sort_by(|a, b| a.id.cmp(&b.id));
    remote.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(local, remote, "entries differ");

    let mut local = client.follows().expect("Failed to list follows");
    let mut remote = client.server.follows();
    local.sort_by(|a, b| a.id.cmp(&b.id));
    remote.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(local, remote, "follows differ");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_sync_protocol::Record;

    #[test]
    fn fixtures_are_valid() {
        assert!(challenge("c-1").validate().is_ok());
        assert!(entry("e-1", "c-1").validate().is_ok());
        assert!(follow("f-1", "c-1").validate().is_ok());
    }

    #[test]
    fn file_client_restarts() {
        let client = TestClient::file(Arc::new(FakeServer::new()));
        client
            .create_challenge(tally_sync_engine::NewChallenge::new(
                "Stretch", 30, "#abc", "leaf",
            ))
            .unwrap();

        let client = client.restart();
        assert_eq!(client.pending_count(), 1);
        assert_eq!(client.challenges().unwrap().len(), 1);
    }
}
