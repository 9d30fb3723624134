//! The sync coordinator.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ledger::{LedgerEntry, PendingLedger, RecordOutcome, RecordPolicy, META_TABLE};
use crate::queue::{DrainReport, ItemStatus, QueueItem, RetryQueue, Verdict};
use crate::reconcile::{merge, MergePlan};
use crate::remote::{RemoteApi, RemoteError, RemoteResult};
use crate::status::{compute_state, Failure, FailureKind, StatusInputs, SyncState};
use crate::store::{now_millis, LocalStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tally_storage::{KvLog, WriteBatch};
use tally_sync_protocol::{
    from_cbor, is_provisional_id, provisional_id, to_cbor, ChangeKind, Challenge, Collection,
    Confirmation, Entity, EntityKey, Entry, EntrySet, Feeling, Follow, PendingChange, Record,
    Timeframe, Visibility,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MODE_KEY: &str = "mode";

/// Which backend a client runs, persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppMode {
    /// Local store only; nothing is sent anywhere.
    LocalOnly,
    /// Full sync with the server.
    Synced,
}

impl AppMode {
    /// Reads the mode recorded in a store, if any.
    pub fn load(log: &KvLog) -> SyncResult<Option<AppMode>> {
        match log.get(META_TABLE, MODE_KEY) {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    fn stage(self, batch: &mut WriteBatch) -> SyncResult<()> {
        batch.put(META_TABLE, MODE_KEY, to_cbor(&self)?);
        Ok(())
    }
}

/// The two ways a client can run.
pub enum Backend<R> {
    /// Local store only; the ledger stays empty.
    LocalOnly,
    /// Full engine against a server.
    Synced {
        /// The server.
        remote: Arc<R>,
        /// Bearer credential, if signed in.
        credentials: Option<String>,
    },
}

impl<R> Backend<R> {
    /// A synced backend.
    pub fn synced(remote: R, credentials: Option<String>) -> Self {
        Backend::Synced {
            remote: Arc::new(remote),
            credentials,
        }
    }

    /// Returns the mode this backend runs in.
    pub fn mode(&self) -> AppMode {
        match self {
            Backend::LocalOnly => AppMode::LocalOnly,
            Backend::Synced { .. } => AppMode::Synced,
        }
    }
}

/// Input for a new challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChallenge {
    /// Display name.
    pub name: String,
    /// Target count.
    pub target: u32,
    /// Counting period.
    pub timeframe: Timeframe,
    /// Hex color.
    pub color: String,
    /// Icon name.
    pub icon: String,
    /// Visibility.
    pub visibility: Visibility,
}

impl NewChallenge {
    /// A private, year-long challenge.
    pub fn new(
        name: impl Into<String>,
        target: u32,
        color: impl Into<String>,
        icon: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            timeframe: Timeframe::year(),
            color: color.into(),
            icon: icon.into(),
            visibility: Visibility::Private,
        }
    }

    /// Sets the timeframe.
    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = timeframe;
        self
    }

    /// Sets the visibility.
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }
}

/// Input for a new entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    /// Owning challenge.
    pub challenge_id: String,
    /// Day, `YYYY-MM-DD`.
    pub date: String,
    /// Logged count.
    pub count: u32,
    /// Optional note.
    pub note: Option<String>,
    /// Optional sets.
    pub sets: Vec<EntrySet>,
    /// Optional effort rating.
    pub feeling: Option<Feeling>,
}

impl NewEntry {
    /// An entry with no note, sets or feeling.
    pub fn new(challenge_id: impl Into<String>, date: impl Into<String>, count: u32) -> Self {
        Self {
            challenge_id: challenge_id.into(),
            date: date.into(),
            count,
            note: None,
            sets: Vec::new(),
            feeling: None,
        }
    }

    /// Sets the note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Sets the sets.
    pub fn with_sets(mut self, sets: Vec<EntrySet>) -> Self {
        self.sets = sets;
        self
    }

    /// Sets the feeling.
    pub fn with_feeling(mut self, feeling: Feeling) -> Self {
        self.feeling = Some(feeling);
        self
    }
}

/// What a refresh changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Server values stored.
    pub upserted: usize,
    /// Stale local records dropped.
    pub removed: usize,
    /// Records kept because of a pending intent.
    pub kept_pending: usize,
}

impl RefreshReport {
    fn absorb<R: Record>(&mut self, plan: &MergePlan<R>) {
        self.upserted += plan.upserts.len();
        self.removed += plan.removals.len();
        self.kept_pending += plan.kept_pending;
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed drains.
    pub drains: u64,
    /// Completed refreshes.
    pub refreshes: u64,
    /// Changes the server confirmed.
    pub confirmed: u64,
    /// Failed shipping attempts.
    pub failed_attempts: u64,
    /// Last completed drain or refresh.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    All,
    Entries(&'a str),
}

enum Next<'a> {
    Gone,
    Skip,
    Defer,
    Ship {
        entry: LedgerEntry,
        item: QueueItem,
        payload: Option<Entity>,
        _flight: FlightGuard<'a>,
    },
}

/// Marks a change as in flight until dropped.
struct FlightGuard<'a>(&'a Mutex<Option<u64>>);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Clears a flag when dropped, including when the owning future is.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Single owner of a client's local state.
///
/// Every mutation goes through the coordinator. It validates the input,
/// then writes the entity, its ledger entry and its queue item as one
/// atomic batch, so the three never disagree after a crash. Share it as
/// `Arc<SyncCoordinator<R>>`; there is no global instance.
///
/// Network work happens in [`drain`](Self::drain) and
/// [`refresh`](Self::refresh). Both can be cancelled with
/// [`cancel`](Self::cancel) or by dropping their future: local state is
/// only ever changed by single batches written between awaits.
pub struct SyncCoordinator<R: RemoteApi> {
    config: SyncConfig,
    log: Arc<KvLog>,
    store: LocalStore,
    ledger: PendingLedger,
    queue: RetryQueue,
    backend: RwLock<Backend<R>>,
    writer: Mutex<()>,
    online: AtomicBool,
    draining: AtomicBool,
    cancel_epoch: AtomicU64,
    in_flight: Mutex<Option<u64>>,
    last_failure: RwLock<Option<Failure>>,
    stats: RwLock<SyncStats>,
}

impl<R: RemoteApi> SyncCoordinator<R> {
    /// Opens a coordinator over a store.
    ///
    /// If the store was last used in the other mode it is converted:
    /// going to synced turns every stored entity into a pending create,
    /// going to local-only discards the ledger.
    pub fn open(log: KvLog, config: SyncConfig, backend: Backend<R>) -> SyncResult<Self> {
        let log = Arc::new(log);
        let wanted = backend.mode();
        let coordinator = Self {
            store: LocalStore::new(Arc::clone(&log)),
            ledger: PendingLedger::open(Arc::clone(&log))?
                .with_collapse_unsynced_deletes(config.collapse_unsynced_deletes),
            queue: RetryQueue::new(Arc::clone(&log), config.retry.clone()),
            config,
            log,
            backend: RwLock::new(backend),
            writer: Mutex::new(()),
            online: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            cancel_epoch: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            last_failure: RwLock::new(None),
            stats: RwLock::new(SyncStats::default()),
        };

        let stored = AppMode::load(&coordinator.log)?;
        if stored != Some(wanted) {
            let _writer = coordinator.writer.lock();
            let mut batch = WriteBatch::new();
            match (stored, wanted) {
                (Some(AppMode::LocalOnly), AppMode::Synced) => {
                    let converted = coordinator.stage_all_as_creates(&mut batch)?;
                    info!(converted, "local-only store converted to synced");
                }
                (Some(AppMode::Synced), AppMode::LocalOnly) => {
                    PendingLedger::stage_clear(&mut batch);
                    RetryQueue::stage_clear(&mut batch);
                    info!("synced store converted to local-only");
                }
                _ => {}
            }
            wanted.stage(&mut batch)?;
            coordinator.log.write(batch)?;
        }

        debug!(mode = ?wanted, pending = coordinator.ledger.len(), "coordinator opened");
        Ok(coordinator)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the current mode.
    pub fn mode(&self) -> AppMode {
        self.backend.read().mode()
    }

    /// Returns the entity store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Returns the ledger.
    pub fn ledger(&self) -> &PendingLedger {
        &self.ledger
    }

    /// Returns the retry queue.
    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Creates a challenge under a provisional id.
    pub fn create_challenge(&self, draft: NewChallenge) -> SyncResult<Challenge> {
        let challenge = Challenge {
            id: provisional_id(),
            name: draft.name,
            target: draft.target,
            timeframe: draft.timeframe,
            color: draft.color,
            icon: draft.icon,
            visibility: draft.visibility,
            archived: false,
            created_at: now_millis(),
        };
        challenge.validate()?;

        self.commit(|batch| {
            LocalStore::stage_upsert_record(batch, &challenge)?;
            self.stage_change(
                batch,
                Collection::Challenges,
                PendingChange::Create(challenge.id.clone()),
                Some(challenge.clone().into_entity()),
            )
        })?;
        debug!(id = %challenge.id, "challenge created");
        Ok(challenge)
    }

    /// Replaces a challenge's fields.
    pub fn update_challenge(&self, challenge: Challenge) -> SyncResult<Challenge> {
        challenge.validate()?;
        self.commit(|batch| {
            self.require::<Challenge>(&challenge.id)?;
            LocalStore::stage_upsert_record(batch, &challenge)?;
            self.stage_change(
                batch,
                Collection::Challenges,
                PendingChange::Update(challenge.id.clone()),
                Some(challenge.clone().into_entity()),
            )
        })?;
        Ok(challenge)
    }

    /// Archives a challenge.
    pub fn archive_challenge(&self, id: &str) -> SyncResult<Challenge> {
        self.commit(|batch| {
            let mut challenge = self.require::<Challenge>(id)?;
            challenge.archived = true;
            LocalStore::stage_upsert_record(batch, &challenge)?;
            self.stage_change(
                batch,
                Collection::Challenges,
                PendingChange::Archive(challenge.id.clone()),
                Some(challenge.clone().into_entity()),
            )?;
            Ok(challenge)
        })
    }

    /// Deletes a challenge with its entries and follows.
    ///
    /// The server deletes the children itself, so their pending changes
    /// are discarded rather than shipped.
    pub fn delete_challenge(&self, id: &str) -> SyncResult<()> {
        self.commit(|batch| {
            let challenge = self.require::<Challenge>(id)?;
            let key = EntityKey::new(Collection::Challenges, id);
            self.stage_cascade(batch, id)?;
            LocalStore::stage_delete(batch, &key);
            self.stage_change(
                batch,
                Collection::Challenges,
                PendingChange::Delete(id.to_string()),
                Some(challenge.into_entity()),
            )
        })?;
        debug!(id, "challenge deleted");
        Ok(())
    }

    /// Logs an entry against an existing challenge.
    pub fn add_entry(&self, draft: NewEntry) -> SyncResult<Entry> {
        let entry = Entry {
            id: provisional_id(),
            challenge_id: draft.challenge_id,
            date: draft.date,
            count: draft.count,
            note: draft.note,
            sets: draft.sets,
            feeling: draft.feeling,
            created_at: now_millis(),
        };
        entry.validate()?;

        self.commit(|batch| {
            self.require::<Challenge>(&entry.challenge_id)?;
            LocalStore::stage_upsert_record(batch, &entry)?;
            self.stage_change(
                batch,
                Collection::Entries,
                PendingChange::Create(entry.id.clone()),
                Some(entry.clone().into_entity()),
            )
        })?;
        Ok(entry)
    }

    /// Replaces an entry's fields.
    pub fn update_entry(&self, entry: Entry) -> SyncResult<Entry> {
        entry.validate()?;
        self.commit(|batch| {
            self.require::<Entry>(&entry.id)?;
            LocalStore::stage_upsert_record(batch, &entry)?;
            self.stage_change(
                batch,
                Collection::Entries,
                PendingChange::Update(entry.id.clone()),
                Some(entry.clone().into_entity()),
            )
        })?;
        Ok(entry)
    }

    /// Deletes an entry.
    pub fn delete_entry(&self, id: &str) -> SyncResult<()> {
        self.commit(|batch| {
            let entry = self.require::<Entry>(id)?;
            LocalStore::stage_delete(batch, &EntityKey::new(Collection::Entries, id));
            self.stage_change(
                batch,
                Collection::Entries,
                PendingChange::Delete(id.to_string()),
                Some(entry.into_entity()),
            )
        })
    }

    /// Follows a public challenge. Following twice returns the existing follow.
    pub fn follow(&self, challenge_id: &str) -> SyncResult<Follow> {
        let now = now_millis();
        let follow = Follow {
            id: provisional_id(),
            challenge_id: challenge_id.to_string(),
            followed_at: now,
            created_at: now,
        };
        follow.validate()?;

        self.commit(|batch| {
            if let Some(existing) = self.find_follow(challenge_id)? {
                return Ok(existing);
            }
            LocalStore::stage_upsert_record(batch, &follow)?;
            self.stage_change(
                batch,
                Collection::Follows,
                PendingChange::Create(follow.id.clone()),
                Some(follow.clone().into_entity()),
            )?;
            Ok(follow)
        })
    }

    /// Stops following a challenge.
    pub fn unfollow(&self, challenge_id: &str) -> SyncResult<()> {
        self.commit(|batch| {
            let follow = self
                .find_follow(challenge_id)?
                .ok_or_else(|| SyncError::not_found(format!("follow of {challenge_id}")))?;
            LocalStore::stage_delete(batch, &EntityKey::new(Collection::Follows, &*follow.id));
            self.stage_change(
                batch,
                Collection::Follows,
                PendingChange::Delete(follow.id.clone()),
                Some(follow.into_entity()),
            )
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Returns every challenge.
    pub fn challenges(&self) -> SyncResult<Vec<Challenge>> {
        self.store.list_all()
    }

    /// Returns the entries of one challenge.
    pub fn entries_for(&self, challenge_id: &str) -> SyncResult<Vec<Entry>> {
        self.store.entries_for(challenge_id)
    }

    /// Returns every follow.
    pub fn follows(&self) -> SyncResult<Vec<Follow>> {
        self.store.list_all()
    }

    /// Returns the current sync status.
    pub fn status(&self) -> SyncState {
        let failure = self.last_failure.read();
        compute_state(StatusInputs {
            ledger_size: self.ledger.len(),
            draining: self.draining.load(Ordering::SeqCst),
            online: self.online.load(Ordering::SeqCst),
            last_failure: failure.as_ref(),
        })
    }

    /// Returns the number of pending changes.
    pub fn pending_count(&self) -> usize {
        self.ledger.len()
    }

    /// Returns the queue items parked as failed.
    pub fn failed_items(&self) -> SyncResult<Vec<QueueItem>> {
        self.queue.failed_items()
    }

    /// Returns the cached failure, if any.
    pub fn last_failure(&self) -> Option<Failure> {
        self.last_failure.read().clone()
    }

    /// Returns sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    // ------------------------------------------------------------------
    // Host controls
    // ------------------------------------------------------------------

    /// Replaces the bearer credential.
    pub fn set_credentials(&self, token: Option<String>) {
        if let Backend::Synced { credentials, .. } = &mut *self.backend.write() {
            *credentials = token;
        }
        let mut failure = self.last_failure.write();
        if failure.as_ref().map(|f| f.kind) == Some(FailureKind::AuthRequired) {
            *failure = None;
        }
    }

    /// Reports the result of a network probe.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            let mut failure = self.last_failure.write();
            if failure.as_ref().is_some_and(|f| !f.kind.needs_user()) {
                *failure = None;
            }
            info!(pending = self.ledger.len(), "network regained");
        }
    }

    /// Asks running drains and refreshes to stop at the next safe point.
    ///
    /// Passes started afterwards are not affected.
    pub fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Puts every failed queue item back in line.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let _writer = self.writer.lock();
        let count = self.queue.retry_failed()?;
        self.sync_item_failure()?;
        info!(count, "failed items requeued");
        Ok(count)
    }

    /// Wipes entities, ledger and queue.
    pub fn reset_local_data(&self) -> SyncResult<()> {
        {
            let _writer = self.writer.lock();
            let mut batch = WriteBatch::new();
            LocalStore::stage_clear(&mut batch);
            PendingLedger::stage_clear(&mut batch);
            RetryQueue::stage_clear(&mut batch);
            self.log.write(batch)?;
            *self.last_failure.write() = None;
        }
        info!("local data reset");
        self.maybe_compact();
        Ok(())
    }

    /// Switches to the synced backend.
    ///
    /// Every stored entity becomes a pending create, parents first.
    /// Returns the number of entities converted. Already synced clients
    /// just get the new remote and credential.
    pub fn switch_to_synced(&self, remote: R, credentials: Option<String>) -> SyncResult<usize> {
        let converted = {
            let _writer = self.writer.lock();
            let converted = if self.mode() == AppMode::Synced {
                0
            } else {
                let mut batch = WriteBatch::new();
                let converted = self.stage_all_as_creates(&mut batch)?;
                AppMode::Synced.stage(&mut batch)?;
                self.log.write(batch)?;
                converted
            };
            *self.backend.write() = Backend::synced(remote, credentials);
            converted
        };
        info!(converted, "switched to synced backend");
        Ok(converted)
    }

    /// Switches to the local-only backend, discarding pending changes.
    pub fn switch_to_local_only(&self) -> SyncResult<()> {
        {
            let _writer = self.writer.lock();
            let mut batch = WriteBatch::new();
            PendingLedger::stage_clear(&mut batch);
            RetryQueue::stage_clear(&mut batch);
            AppMode::LocalOnly.stage(&mut batch)?;
            self.log.write(batch)?;
            *self.backend.write() = Backend::LocalOnly;
            *self.last_failure.write() = None;
        }
        info!("switched to local-only backend");
        Ok(())
    }

    /// Runs [`sync`](Self::sync) every `sync_interval` until `shutdown`
    /// turns true or its sender is dropped.
    ///
    /// After a transient failure the next run waits for the retry
    /// backoff instead of the interval. Returns `None` if no interval is
    /// configured.
    pub fn spawn_auto_sync(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let interval = self.config.sync_interval?;
        let this = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let delay = if failures == 0 {
                    interval
                } else {
                    this.config.retry.delay_for_attempt(failures)
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }

                match this.sync().await {
                    Ok((_, report)) => {
                        failures = 0;
                        debug!(confirmed = report.confirmed, "auto sync pass");
                    }
                    Err(SyncError::LocalOnly | SyncError::Cancelled) => failures = 0,
                    Err(err) if err.is_retryable() => {
                        failures = failures.saturating_add(1);
                        warn!(error = %err, failures, "auto sync failed, backing off");
                    }
                    Err(err) => {
                        failures = 0;
                        warn!(error = %err, "auto sync failed");
                    }
                }
            }
            debug!("auto sync stopped");
        }))
    }

    // ------------------------------------------------------------------
    // Network passes
    // ------------------------------------------------------------------

    /// Refreshes from the server, then drains the queue.
    pub async fn sync(&self) -> SyncResult<(RefreshReport, DrainReport)> {
        let epoch = self.epoch();
        let refreshed = self.refresh_pass(Scope::All, epoch).await;
        let refreshed = self.observe(refreshed)?;
        let drained = self.drain_pass(epoch).await;
        let drained = self.observe(drained)?;
        Ok((refreshed, drained))
    }

    /// Fetches challenges, follows and every challenge's entries, then
    /// reconciles each collection.
    ///
    /// Nothing is written unless every fetch succeeds.
    pub async fn refresh(&self) -> SyncResult<RefreshReport> {
        let result = self.refresh_pass(Scope::All, self.epoch()).await;
        self.observe(result)
    }

    /// Reconciles the entries of one challenge. Other challenges' entries
    /// are out of scope and untouched.
    pub async fn refresh_entries(&self, challenge_id: &str) -> SyncResult<RefreshReport> {
        let result = self
            .refresh_pass(Scope::Entries(challenge_id), self.epoch())
            .await;
        self.observe(result)
    }

    /// Ships pending changes, oldest first.
    ///
    /// Only one drain runs at a time; a call made while one is running
    /// returns [`DrainReport::coalesced`] immediately.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        let result = self.drain_pass(self.epoch()).await;
        self.observe(result)
    }

    async fn refresh_pass(&self, scope: Scope<'_>, epoch: u64) -> SyncResult<RefreshReport> {
        let (remote, token) = self.remote()?;

        let fetched = match scope {
            Scope::All => {
                let deleted = self.pending_deleted_challenges()?;
                let challenges = self.call(remote.fetch_challenges(&token)).await?;
                self.check_cancelled(epoch)?;
                let mut follows = self.call(remote.fetch_follows(&token)).await?;
                follows.retain(|f| !deleted.contains(&f.challenge_id));

                let mut entries = Vec::new();
                for challenge in challenges.iter().filter(|c| !deleted.contains(&c.id)) {
                    self.check_cancelled(epoch)?;
                    entries.extend(self.call(remote.fetch_entries(&challenge.id, &token)).await?);
                }
                (Some(challenges), entries, Some(follows))
            }
            Scope::Entries(challenge_id) => {
                let entries = self.call(remote.fetch_entries(challenge_id, &token)).await?;
                (None, entries, None)
            }
        };

        self.check_cancelled(epoch)?;
        let report = self.commit_refresh(&scope, fetched, epoch)?;
        self.online.store(true, Ordering::SeqCst);
        info!(
            upserted = report.upserted,
            removed = report.removed,
            kept_pending = report.kept_pending,
            "refresh merged"
        );
        self.maybe_compact();
        Ok(report)
    }

    fn commit_refresh(
        &self,
        scope: &Scope<'_>,
        (challenges, entries, follows): (Option<Vec<Challenge>>, Vec<Entry>, Option<Vec<Follow>>),
        epoch: u64,
    ) -> SyncResult<RefreshReport> {
        let _writer = self.writer.lock();
        self.check_cancelled(epoch)?;

        let mut batch = WriteBatch::new();
        let mut report = RefreshReport::default();

        if let Some(challenges) = challenges {
            let local = self.store.list_all::<Challenge>()?;
            report.absorb(&self.stage_merge(&mut batch, challenges, local)?);
        }
        let local_entries = match scope {
            Scope::All => self.store.list_all::<Entry>()?,
            Scope::Entries(challenge_id) => self.store.entries_for(challenge_id)?,
        };
        report.absorb(&self.stage_merge(&mut batch, entries, local_entries)?);
        if let Some(follows) = follows {
            let local = self.store.list_all::<Follow>()?;
            report.absorb(&self.stage_merge(&mut batch, follows, local)?);
        }

        self.log.write(batch)?;

        let mut stats = self.stats.write();
        stats.refreshes += 1;
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = None;
        drop(stats);

        let mut failure = self.last_failure.write();
        if failure
            .as_ref()
            .is_some_and(|f| matches!(f.kind, FailureKind::Fetch | FailureKind::Storage))
        {
            *failure = None;
        }
        Ok(report)
    }

    fn stage_merge<T: Record>(
        &self,
        batch: &mut WriteBatch,
        server: Vec<T>,
        local: Vec<T>,
    ) -> SyncResult<MergePlan<T>> {
        let pending = self.ledger.pending_ids(T::COLLECTION)?;
        let plan = merge(server, local, &pending);
        plan.stage(batch)?;
        debug!(
            collection = %T::COLLECTION,
            upserted = plan.upserts.len(),
            removed = plan.removals.len(),
            kept_pending = plan.kept_pending,
            "collection merged"
        );
        Ok(plan)
    }

    async fn drain_pass(&self, epoch: u64) -> SyncResult<DrainReport> {
        let (remote, token) = self.remote()?;
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("drain already running, request coalesced");
            return Ok(DrainReport::coalesced());
        }
        let _draining = FlagGuard(&self.draining);

        info!(pending = self.ledger.len(), "drain started");
        let mut report = DrainReport::default();
        let result = self.drain_entries(&remote, &token, &mut report, epoch).await;

        report.remaining = self.ledger.len();
        {
            let mut stats = self.stats.write();
            stats.drains += 1;
            stats.confirmed += report.confirmed as u64;
            stats.last_sync_time = Some(Instant::now());
        }
        let noted = self.sync_item_failure();
        if let Err(error) = result {
            if let Err(secondary) = noted {
                warn!(error = %secondary, "could not refresh item failure after drain error");
            }
            return Err(error);
        }
        noted?;

        info!(
            confirmed = report.confirmed,
            retried = report.retried,
            failed = report.failed,
            dropped = report.dropped,
            remaining = report.remaining,
            "drain finished"
        );
        self.maybe_compact();
        Ok(report)
    }

    async fn drain_entries(
        &self,
        remote: &R,
        token: &str,
        report: &mut DrainReport,
        epoch: u64,
    ) -> SyncResult<()> {
        for listed in self.ledger.list()? {
            self.check_cancelled(epoch)?;

            let (entry, item, payload, flight) = match self.next_shipment(&listed.key())? {
                Next::Gone => continue,
                Next::Skip => {
                    report.skipped += 1;
                    continue;
                }
                Next::Defer => {
                    report.deferred += 1;
                    continue;
                }
                Next::Ship {
                    entry,
                    item,
                    payload,
                    _flight,
                } => (entry, item, payload, _flight),
            };

            report.attempted += 1;
            let outcome = self
                .call(Self::dispatch(remote, token, &entry, payload.as_ref()))
                .await;

            let stop = match outcome {
                Ok(confirmation) => {
                    self.confirm(&entry, confirmation)?;
                    report.confirmed += 1;
                    false
                }
                Err(error) => self.settle(&entry, item, &error, report)?,
            };
            drop(flight);

            if stop {
                break;
            }
        }
        Ok(())
    }

    /// Picks up the current state of a ledger entry and marks it in flight.
    fn next_shipment(&self, key: &EntityKey) -> SyncResult<Next<'_>> {
        let _writer = self.writer.lock();

        // Earlier shipments may have replaced or removed the entry.
        let Some(entry) = self.ledger.get(key)? else {
            return Ok(Next::Gone);
        };
        let item = match self.queue.get(entry.change_id)? {
            Some(item) => item,
            None => self.queue.enqueue(&entry, self.store.get_entity(key)?)?,
        };
        if item.is_failed() {
            return Ok(Next::Skip);
        }

        let payload = self.store.get_entity(key)?.or_else(|| item.payload.clone());
        if let Some(parent) = payload.as_ref().and_then(Entity::challenge_id) {
            let parent_key = EntityKey::new(Collection::Challenges, parent);
            let parent_pending = is_provisional_id(parent)
                && self
                    .ledger
                    .get(&parent_key)?
                    .is_some_and(|p| p.change.kind() == ChangeKind::Create);
            if parent_pending {
                return Ok(Next::Defer);
            }
        }

        *self.in_flight.lock() = Some(entry.change_id);
        Ok(Next::Ship {
            entry,
            item,
            payload,
            _flight: FlightGuard(&self.in_flight),
        })
    }

    async fn dispatch(
        remote: &R,
        token: &str,
        entry: &LedgerEntry,
        payload: Option<&Entity>,
    ) -> RemoteResult<Confirmation> {
        let id = entry.change.entity_id();
        match (entry.change.kind(), payload) {
            (ChangeKind::Create, Some(Entity::Challenge(c))) => {
                remote.create_challenge(c, token).await
            }
            (ChangeKind::Update, Some(Entity::Challenge(c))) => {
                remote.update_challenge(c, token).await
            }
            (ChangeKind::Archive, Some(Entity::Challenge(c))) => {
                remote.archive_challenge(c, token).await
            }
            (ChangeKind::Delete, Some(Entity::Challenge(_))) => {
                remote.delete_challenge(id, token).await
            }
            (ChangeKind::Create, Some(Entity::Entry(e))) => remote.create_entry(e, token).await,
            (ChangeKind::Update, Some(Entity::Entry(e))) => remote.update_entry(e, token).await,
            (ChangeKind::Delete, Some(Entity::Entry(_))) => remote.delete_entry(id, token).await,
            (ChangeKind::Create, Some(Entity::Follow(f))) => {
                remote.follow(&f.challenge_id, token).await
            }
            (ChangeKind::Delete, Some(Entity::Follow(f))) => {
                remote.unfollow(&f.challenge_id, token).await
            }
            (kind, Some(entity)) => Err(RemoteError::Rejected(format!(
                "{kind} is not supported for {}",
                entity.collection()
            ))),
            (kind, None) => Err(RemoteError::Rejected(format!(
                "no payload recorded for {kind} of {}",
                entry.key()
            ))),
        }
    }

    /// Applies a confirmation.
    fn confirm(&self, shipped: &LedgerEntry, confirmation: Confirmation) -> SyncResult<()> {
        let _writer = self.writer.lock();
        let key = shipped.key();
        let current = self.ledger.get(&key)?;

        let mut batch = WriteBatch::new();
        RetryQueue::stage_remove(&mut batch, shipped.change_id);

        match current {
            // Discarded while in flight, e.g. by a cascade or a reset.
            None => {}
            Some(current) if current.change_id == shipped.change_id => {
                PendingLedger::stage_remove(&mut batch, &key);
                if let Some(server) = confirmation.record().filter(|e| e.collection() == key.collection) {
                    if shipped.change.kind() == ChangeKind::Create && server.id() != key.id {
                        self.stage_rewrite_id(&mut batch, &key, server.clone(), None)?;
                    } else if shipped.change.kind() != ChangeKind::Delete && server.id() == key.id {
                        LocalStore::stage_upsert(&mut batch, server)?;
                    }
                }
            }
            // Superseded while in flight: the newer intent still ships,
            // but the server now knows the entity.
            Some(current) => {
                if shipped.change.kind() == ChangeKind::Create {
                    match confirmation.record().filter(|e| e.collection() == key.collection) {
                        Some(server) if server.id() != key.id => {
                            self.stage_rewrite_id(&mut batch, &key, server.clone(), Some(&current))?;
                        }
                        _ => self.stage_promote(&mut batch, &current, None)?,
                    }
                }
            }
        }

        self.log.write(batch)?;
        debug!(entity = %key, kind = ?shipped.change.kind(), "change confirmed");
        Ok(())
    }

    /// Moves an entity from its provisional id to the server's id.
    fn stage_rewrite_id(
        &self,
        batch: &mut WriteBatch,
        old: &EntityKey,
        server: Entity,
        superseding: Option<&LedgerEntry>,
    ) -> SyncResult<()> {
        let new_id = server.id().to_string();
        LocalStore::stage_delete(batch, old);

        match superseding {
            None => LocalStore::stage_upsert(batch, &server)?,
            Some(next) => {
                // Local edits made while the create was in flight win.
                if let Some(mut local) = self.store.get_entity(old)? {
                    local.set_id(new_id.as_str());
                    LocalStore::stage_upsert(batch, &local)?;
                }
                self.stage_promote(batch, next, Some(new_id.as_str()))?;
            }
        }

        if old.collection == Collection::Challenges {
            for mut child in self.store.children_of(&old.id)? {
                child.rewrite_challenge_id(&old.id, &new_id);
                LocalStore::stage_upsert(batch, &child)?;
            }
            for mut item in self.queue.list()? {
                let rewritten = item
                    .payload
                    .as_mut()
                    .is_some_and(|p| p.rewrite_challenge_id(&old.id, &new_id));
                if rewritten {
                    RetryQueue::stage_put(batch, &item)?;
                }
            }
        }

        info!(from = %old, to = %new_id, "provisional id replaced");
        Ok(())
    }

    /// Re-files a superseding entry once its create has been confirmed:
    /// a create becomes an update, optionally under a new id.
    fn stage_promote(
        &self,
        batch: &mut WriteBatch,
        next: &LedgerEntry,
        new_id: Option<&str>,
    ) -> SyncResult<()> {
        let id = new_id.unwrap_or(next.change.entity_id());
        let kind = match next.change.kind() {
            ChangeKind::Create => ChangeKind::Update,
            other => other,
        };

        let mut promoted = next.clone();
        promoted.change = PendingChange::new(kind, id);
        if new_id.is_some() {
            PendingLedger::stage_remove(batch, &next.key());
        }
        PendingLedger::stage_put(batch, &promoted)?;

        if let Some(mut item) = self.queue.get(next.change_id)? {
            item.key = promoted.key();
            item.kind = kind;
            if let Some(payload) = item.payload.as_mut() {
                payload.set_id(id);
            }
            RetryQueue::stage_put(batch, &item)?;
        }
        Ok(())
    }

    /// Settles a failed shipment. Returns true if the drain should stop.
    fn settle(
        &self,
        shipped: &LedgerEntry,
        item: QueueItem,
        error: &RemoteError,
        report: &mut DrainReport,
    ) -> SyncResult<bool> {
        let _writer = self.writer.lock();
        let key = shipped.key();
        self.stats.write().failed_attempts += 1;

        let still_current = self
            .ledger
            .get(&key)?
            .is_some_and(|c| c.change_id == shipped.change_id);

        match self.queue.judge(item, error) {
            Verdict::Reauthenticate => {
                warn!(entity = %key, "server refused credentials, drain stopped");
                return Err(SyncError::AuthRequired {
                    message: error.to_string(),
                });
            }
            _ if !still_current => {
                debug!(entity = %key, "failed change was superseded while in flight");
            }
            Verdict::Retry(item) => {
                let mut batch = WriteBatch::new();
                RetryQueue::stage_put(&mut batch, &item)?;
                self.log.write(batch)?;
                report.retried += 1;
                warn!(entity = %key, attempts = item.attempts, error = %error, "change will be retried");
            }
            Verdict::Park(item) => {
                let mut batch = WriteBatch::new();
                RetryQueue::stage_put(&mut batch, &item)?;
                self.log.write(batch)?;
                report.failed += 1;
                warn!(entity = %key, attempts = item.attempts, error = %error, "change failed");
            }
            Verdict::Drop => {
                let mut batch = WriteBatch::new();
                PendingLedger::stage_remove(&mut batch, &key);
                RetryQueue::stage_remove(&mut batch, shipped.change_id);
                if key.collection == Collection::Challenges {
                    self.stage_cascade(&mut batch, &key.id)?;
                }
                LocalStore::stage_delete(&mut batch, &key);
                self.log.write(batch)?;
                report.dropped += 1;
                warn!(entity = %key, error = %error, "entity gone on server, change dropped");
            }
        }

        if matches!(error, RemoteError::Network(_)) {
            self.online.store(false, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn commit<T>(&self, stage: impl FnOnce(&mut WriteBatch) -> SyncResult<T>) -> SyncResult<T> {
        let _writer = self.writer.lock();
        let mut batch = WriteBatch::new();
        let value = stage(&mut batch)?;
        self.log.write(batch)?;
        Ok(value)
    }

    fn require<T: Record>(&self, id: &str) -> SyncResult<T> {
        self.store
            .get::<T>(id)?
            .ok_or_else(|| SyncError::not_found(EntityKey::new(T::COLLECTION, id).to_string()))
    }

    fn find_follow(&self, challenge_id: &str) -> SyncResult<Option<Follow>> {
        Ok(self
            .store
            .list_all::<Follow>()?
            .into_iter()
            .find(|f| f.challenge_id == challenge_id))
    }

    /// Stages a ledger entry and its queue item, unless local-only.
    fn stage_change(
        &self,
        batch: &mut WriteBatch,
        collection: Collection,
        change: PendingChange,
        snapshot: Option<Entity>,
    ) -> SyncResult<()> {
        if self.mode() == AppMode::LocalOnly {
            return Ok(());
        }
        self.stage_recorded_change(batch, collection, change, snapshot)
    }

    fn stage_recorded_change(
        &self,
        batch: &mut WriteBatch,
        collection: Collection,
        change: PendingChange,
        snapshot: Option<Entity>,
    ) -> SyncResult<()> {
        let policy = RecordPolicy {
            collapse_unsynced_deletes: self.ledger.collapses_unsynced_deletes(),
            in_flight: *self.in_flight.lock(),
        };
        match self.ledger.stage_record(batch, collection, change, policy)? {
            RecordOutcome::Recorded { entry, replaced } => {
                if let Some(old) = replaced {
                    RetryQueue::stage_remove(batch, old);
                }
                RetryQueue::stage_enqueue(batch, &entry, snapshot)?;
            }
            RecordOutcome::Collapsed { removed } => RetryQueue::stage_remove(batch, removed),
        }
        Ok(())
    }

    /// Removes a challenge's entries and follows, with their pending changes.
    fn stage_cascade(&self, batch: &mut WriteBatch, challenge_id: &str) -> SyncResult<()> {
        for child in self.store.children_of(challenge_id)? {
            let key = child.key();
            if let Some(entry) = self.ledger.get(&key)? {
                PendingLedger::stage_remove(batch, &key);
                RetryQueue::stage_remove(batch, entry.change_id);
            }
            LocalStore::stage_delete(batch, &key);
        }
        Ok(())
    }

    fn stage_all_as_creates(&self, batch: &mut WriteBatch) -> SyncResult<usize> {
        let mut converted = 0;
        for collection in Collection::ALL {
            for entity in self.store.list_entities(collection)? {
                let change = PendingChange::Create(entity.id().to_string());
                self.stage_recorded_change(batch, collection, change, Some(entity))?;
                converted += 1;
            }
        }
        Ok(converted)
    }

    fn pending_deleted_challenges(&self) -> SyncResult<HashSet<String>> {
        Ok(self
            .ledger
            .list()?
            .into_iter()
            .filter(|e| {
                e.collection == Collection::Challenges && e.change.kind() == ChangeKind::Delete
            })
            .map(|e| e.change.entity_id().to_string())
            .collect())
    }

    fn remote(&self) -> SyncResult<(Arc<R>, String)> {
        match &*self.backend.read() {
            Backend::LocalOnly => Err(SyncError::LocalOnly),
            Backend::Synced {
                credentials: None, ..
            } => Err(SyncError::AuthRequired {
                message: "no credentials".into(),
            }),
            Backend::Synced {
                remote,
                credentials: Some(token),
            } => Ok((Arc::clone(remote), token.clone())),
        }
    }

    async fn call<T>(&self, request: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Network(format!(
                "request timed out after {timeout:?}"
            ))),
        }
    }

    /// Cancellation generation a pass starts under.
    fn epoch(&self) -> u64 {
        self.cancel_epoch.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self, epoch: u64) -> SyncResult<()> {
        if self.cancel_epoch.load(Ordering::SeqCst) != epoch {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Records the failure of a network pass for the status surface.
    fn observe<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(err) = &result {
            self.note_failure(err);
        }
        result
    }

    fn note_failure(&self, err: &SyncError) {
        let kind = match err {
            SyncError::Network { .. } => {
                self.online.store(false, Ordering::SeqCst);
                None
            }
            SyncError::AuthRequired { .. } => Some(FailureKind::AuthRequired),
            SyncError::Storage(_) | SyncError::Protocol(_) => Some(FailureKind::Storage),
            SyncError::Remote { .. } | SyncError::Conflict { .. } | SyncError::Validation { .. } => {
                Some(FailureKind::Fetch)
            }
            SyncError::Cancelled
            | SyncError::LocalOnly
            | SyncError::NotFound { .. }
            | SyncError::InvalidChange { .. } => None,
        };
        if let Some(kind) = kind {
            *self.last_failure.write() = Some(Failure::new(kind, err.to_string()));
        }
        self.stats.write().last_error = Some(err.to_string());
        warn!(error = %err, "sync pass failed");
    }

    /// Mirrors failed queue items into the cached failure.
    ///
    /// Failures that are not about a particular item take precedence.
    fn sync_item_failure(&self) -> SyncResult<()> {
        let derived = self
            .queue
            .failed_items()?
            .into_iter()
            .find_map(|item| match item.status {
                ItemStatus::Failed { kind, reason } => Some(Failure::new(kind, reason)),
                ItemStatus::Waiting => None,
            });

        let mut failure = self.last_failure.write();
        let item_level = failure.as_ref().map_or(true, |f| {
            matches!(f.kind, FailureKind::Validation | FailureKind::RetriesExhausted)
        });
        if item_level {
            *failure = derived;
        }
        Ok(())
    }

    fn maybe_compact(&self) {
        match self.log.compact_if_larger_than(self.config.compact_threshold) {
            Ok(true) => info!("store compacted"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "store compaction failed"),
        }
    }
}

impl<R: RemoteApi> std::fmt::Debug for SyncCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("mode", &self.mode())
            .field("pending", &self.ledger.len())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
