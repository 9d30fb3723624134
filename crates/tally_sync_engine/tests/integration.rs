//! Integration tests for the coordinator over durable storage.

use std::sync::Arc;
use std::time::Duration;
use tally_storage::{FileBackend, KvLog};
use tally_sync_engine::{
    AppMode, Backend, MockRemote, NewChallenge, NewEntry, RemoteError, SyncConfig,
    SyncCoordinator, SyncState,
};
use tally_sync_protocol::{Challenge, Record, Timeframe, Visibility};
use tempfile::TempDir;
use tokio::sync::watch;

fn open(dir: &TempDir, remote: &Arc<MockRemote>) -> SyncCoordinator<MockRemote> {
    open_with(dir, remote, SyncConfig::default())
}

fn open_with(
    dir: &TempDir,
    remote: &Arc<MockRemote>,
    config: SyncConfig,
) -> SyncCoordinator<MockRemote> {
    let backend = FileBackend::open_with_create_dirs(&dir.path().join("tally.log")).unwrap();
    let log = KvLog::open(Box::new(backend)).unwrap();
    SyncCoordinator::open(
        log,
        config,
        Backend::Synced {
            remote: Arc::clone(remote),
            credentials: Some("token".into()),
        },
    )
    .unwrap()
}

fn server_challenge(id: &str) -> Challenge {
    Challenge {
        id: id.into(),
        name: "Pushups".into(),
        target: 1000,
        timeframe: Timeframe::year(),
        color: "#3a3".into(),
        icon: "dumbbell".into(),
        visibility: Visibility::Public,
        archived: false,
        created_at: 1,
    }
}

#[tokio::test]
async fn pending_changes_survive_restart() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockRemote::new());

    let challenge_id = {
        let coordinator = open(&dir, &remote);
        let challenge = coordinator
            .create_challenge(NewChallenge::new("Read", 24, "#00f", "book"))
            .unwrap();
        coordinator
            .add_entry(NewEntry::new(&challenge.id, "2026-01-10", 2).with_note("two chapters"))
            .unwrap();

        remote.push_response(Err(RemoteError::Network("no route".into())));
        let report = coordinator.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        challenge.id
    };

    let coordinator = open(&dir, &remote);
    assert_eq!(coordinator.status(), SyncState::Pending(2));
    let first = &coordinator.ledger().list().unwrap()[0];
    assert_eq!(first.change.entity_id(), challenge_id);
    assert_eq!(
        coordinator.queue().get(first.change_id).unwrap().unwrap().attempts,
        1
    );

    let report = coordinator.drain().await.unwrap();
    assert_eq!(report.confirmed, 2);
    assert_eq!(coordinator.status(), SyncState::Synced);
    assert_eq!(coordinator.entries_for(&challenge_id).unwrap().len(), 1);
}

#[tokio::test]
async fn mode_survives_restart() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockRemote::new());
    drop(open(&dir, &remote));

    let backend = FileBackend::open(&dir.path().join("tally.log")).unwrap();
    let log = KvLog::open(Box::new(backend)).unwrap();
    assert_eq!(AppMode::load(&log).unwrap(), Some(AppMode::Synced));
}

#[tokio::test]
async fn sync_refreshes_then_drains() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockRemote::new());
    let coordinator = open(&dir, &remote);

    remote.set_challenges(vec![server_challenge("srv-1")]);
    let mut edited = server_challenge("srv-1");
    edited.name = "Pushups daily".into();

    let (refreshed, drained) = coordinator.sync().await.unwrap();
    assert_eq!(refreshed.upserted, 1);
    assert_eq!(drained.attempted, 0);

    coordinator.update_challenge(edited.clone()).unwrap();
    let (refreshed, drained) = coordinator.sync().await.unwrap();
    // The server still has the old name, but the pending edit wins.
    assert_eq!(refreshed.kept_pending, 1);
    assert_eq!(drained.confirmed, 1);
    assert_eq!(coordinator.challenges().unwrap(), vec![edited]);
    assert_eq!(
        remote.calls(),
        vec![
            "fetch_challenges *",
            "fetch_follows *",
            "fetch_entries *",
            "fetch_challenges *",
            "fetch_follows *",
            "fetch_entries *",
            "update_challenge srv-1",
        ]
    );
}

#[tokio::test]
async fn auto_sync_drains_and_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockRemote::new());
    let config = SyncConfig::default().with_sync_interval(Duration::from_millis(10));
    let coordinator = Arc::new(open_with(&dir, &remote, config));

    let challenge = coordinator
        .create_challenge(NewChallenge::new("Walk", 365, "#777", "shoe"))
        .unwrap();
    remote.set_challenges(vec![]);

    let (shutdown, rx) = watch::channel(false);
    let handle = coordinator.spawn_auto_sync(rx).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator.pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(remote
        .calls()
        .contains(&format!("create_challenge {}", challenge.id)));

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn auto_sync_needs_an_interval() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockRemote::new());
    let coordinator = Arc::new(open(&dir, &remote));
    let (_shutdown, rx) = watch::channel(false);
    assert!(coordinator.spawn_auto_sync(rx).is_none());
}

#[tokio::test]
async fn confirmed_record_replaces_local_copy() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MockRemote::new());
    let coordinator = open(&dir, &remote);

    let challenge = coordinator
        .create_challenge(NewChallenge::new("Swim", 40, "#0ff", "wave"))
        .unwrap();
    let mut server_copy = challenge.clone();
    server_copy.id = "srv-swim".into();
    server_copy.created_at = 99;
    remote.push_response(Ok(tally_sync_protocol::Confirmation::Record(
        server_copy.clone().into_entity(),
    )));

    coordinator.drain().await.unwrap();
    assert_eq!(coordinator.challenges().unwrap(), vec![server_copy]);
}
