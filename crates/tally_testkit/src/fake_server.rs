//! An in-memory authoritative server.
//!
//! [`FakeServer`] behaves like the real backend closely enough to run
//! clients against it end to end: it assigns its own ids, validates
//! payloads, cascades challenge deletes and answers unknown ids with
//! `NotFound`. Faults can be injected per call.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tally_sync_engine::{RemoteApi, RemoteError, RemoteResult};
use tally_sync_protocol::{Challenge, Confirmation, Entry, Follow, Record};

#[derive(Debug, Default)]
struct State {
    challenges: BTreeMap<String, Challenge>,
    entries: BTreeMap<String, Entry>,
    follows: BTreeMap<String, Follow>,
    next_id: u64,
    clock: u64,
}

impl State {
    fn assign_id(&mut self) -> String {
        self.next_id += 1;
        format!("srv-{}", self.next_id)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Authoritative in-memory server implementing [`RemoteApi`].
#[derive(Debug, Default)]
pub struct FakeServer {
    state: Mutex<State>,
    token: Mutex<Option<String>>,
    offline: Mutex<bool>,
    faults: Mutex<VecDeque<RemoteError>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FakeServer {
    /// Creates an empty server that accepts any token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts only `token` from now on.
    pub fn require_token(&self, token: impl Into<String>) {
        *self.token.lock() = Some(token.into());
    }

    /// Fails every call with a network error while `offline` is true.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    /// Fails the next call with `error`. Calls queue up in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.faults.lock().push_back(error);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Returns how often an operation was called, faults included.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Returns the total number of calls.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Returns the stored challenges.
    pub fn challenges(&self) -> Vec<Challenge> {
        self.state.lock().challenges.values().cloned().collect()
    }

    /// Returns the stored entries.
    pub fn entries(&self) -> Vec<Entry> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Returns the stored follows.
    pub fn follows(&self) -> Vec<Follow> {
        self.state.lock().follows.values().cloned().collect()
    }

    /// Stores a challenge as if another device had created it.
    pub fn seed_challenge(&self, mut challenge: Challenge) -> Challenge {
        let mut state = self.state.lock();
        challenge.id = state.assign_id();
        state
            .challenges
            .insert(challenge.id.clone(), challenge.clone());
        challenge
    }

    /// Stores an entry as if another device had logged it.
    pub fn seed_entry(&self, mut entry: Entry) -> Entry {
        let mut state = self.state.lock();
        entry.id = state.assign_id();
        state.entries.insert(entry.id.clone(), entry.clone());
        entry
    }

    /// Deletes a challenge as if another device had.
    pub fn remove_challenge(&self, id: &str) {
        let mut state = self.state.lock();
        state.challenges.remove(id);
        state.entries.retain(|_, e| e.challenge_id != id);
        state.follows.retain(|_, f| f.challenge_id != id);
    }

    async fn enter(&self, operation: &'static str, token: &str) -> RemoteResult<()> {
        *self.calls.lock().entry(operation).or_default() += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if *self.offline.lock() {
            return Err(RemoteError::Network("server unreachable".into()));
        }
        if let Some(fault) = self.faults.lock().pop_front() {
            return Err(fault);
        }
        match &*self.token.lock() {
            Some(expected) if expected != token => {
                Err(RemoteError::Unauthorized("invalid token".into()))
            }
            _ => Ok(()),
        }
    }
}

fn check<R: Record>(record: &R) -> RemoteResult<()> {
    record
        .validate()
        .map_err(|err| RemoteError::Rejected(err.to_string()))
}

fn missing(kind: &str, id: &str) -> RemoteError {
    RemoteError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl RemoteApi for FakeServer {
    async fn fetch_challenges(&self, token: &str) -> RemoteResult<Vec<Challenge>> {
        self.enter("fetch_challenges", token).await?;
        Ok(self.challenges())
    }

    async fn fetch_entries(&self, challenge_id: &str, token: &str) -> RemoteResult<Vec<Entry>> {
        self.enter("fetch_entries", token).await?;
        let state = self.state.lock();
        if !state.challenges.contains_key(challenge_id) {
            return Err(missing("challenge", challenge_id));
        }
        Ok(state
            .entries
            .values()
            .filter(|e| e.challenge_id == challenge_id)
            .cloned()
            .collect())
    }

    async fn fetch_follows(&self, token: &str) -> RemoteResult<Vec<Follow>> {
        self.enter("fetch_follows", token).await?;
        Ok(self.follows())
    }

    async fn create_challenge(
        &self,
        challenge: &Challenge,
        token: &str,
    ) -> RemoteResult<Confirmation> {
        self.enter("create_challenge", token).await?;
        check(challenge)?;
        let mut state = self.state.lock();
        let mut stored = challenge.clone();
        stored.id = state.assign_id();
        state.challenges.insert(stored.id.clone(), stored.clone());
        Ok(Confirmation::Record(stored.into_entity()))
    }

    async fn update_challenge(
        &self,
        challenge: &Challenge,
        token: &str,
    ) -> RemoteResult<Confirmation> {
        self.enter("update_challenge", token).await?;
        check(challenge)?;
        let mut state = self.state.lock();
        let slot = state
            .challenges
            .get_mut(&challenge.id)
            .ok_or_else(|| missing("challenge", &challenge.id))?;
        *slot = challenge.clone();
        Ok(Confirmation::Record(challenge.clone().into_entity()))
    }

    async fn delete_challenge(&self, id: &str, token: &str) -> RemoteResult<Confirmation> {
        self.enter("delete_challenge", token).await?;
        let mut state = self.state.lock();
        if state.challenges.remove(id).is_none() {
            return Err(missing("challenge", id));
        }
        state.entries.retain(|_, e| e.challenge_id != id);
        state.follows.retain(|_, f| f.challenge_id != id);
        Ok(Confirmation::Ack)
    }

    async fn archive_challenge(
        &self,
        challenge: &Challenge,
        token: &str,
    ) -> RemoteResult<Confirmation> {
        self.enter("archive_challenge", token).await?;
        check(challenge)?;
        let mut state = self.state.lock();
        let slot = state
            .challenges
            .get_mut(&challenge.id)
            .ok_or_else(|| missing("challenge", &challenge.id))?;
        *slot = Challenge {
            archived: true,
            ..challenge.clone()
        };
        Ok(Confirmation::Record(slot.clone().into_entity()))
    }

    async fn create_entry(&self, entry: &Entry, token: &str) -> RemoteResult<Confirmation> {
        self.enter("create_entry", token).await?;
        check(entry)?;
        let mut state = self.state.lock();
        if !state.challenges.contains_key(&entry.challenge_id) {
            return Err(missing("challenge", &entry.challenge_id));
        }
        let mut stored = entry.clone();
        stored.id = state.assign_id();
        state.entries.insert(stored.id.clone(), stored.clone());
        Ok(Confirmation::Record(stored.into_entity()))
    }

    async fn update_entry(&self, entry: &Entry, token: &str) -> RemoteResult<Confirmation> {
        self.enter("update_entry", token).await?;
        check(entry)?;
        let mut state = self.state.lock();
        let slot = state
            .entries
            .get_mut(&entry.id)
            .ok_or_else(|| missing("entry", &entry.id))?;
        *slot = entry.clone();
        Ok(Confirmation::Record(entry.clone().into_entity()))
    }

    async fn delete_entry(&self, id: &str, token: &str) -> RemoteResult<Confirmation> {
        self.enter("delete_entry", token).await?;
        let mut state = self.state.lock();
        state
            .entries
            .remove(id)
            .map(|_| Confirmation::Ack)
            .ok_or_else(|| missing("entry", id))
    }

    async fn follow(&self, challenge_id: &str, token: &str) -> RemoteResult<Confirmation> {
        self.enter("follow", token).await?;
        let mut state = self.state.lock();
        if !state.challenges.contains_key(challenge_id) {
            return Err(missing("challenge", challenge_id));
        }
        if state.follows.values().any(|f| f.challenge_id == challenge_id) {
            return Ok(Confirmation::Ack);
        }
        let now = state.tick();
        let follow = Follow {
            id: state.assign_id(),
            challenge_id: challenge_id.to_string(),
            followed_at: now,
            created_at: now,
        };
        state.follows.insert(follow.id.clone(), follow);
        Ok(Confirmation::Ack)
    }

    async fn unfollow(&self, challenge_id: &str, token: &str) -> RemoteResult<Confirmation> {
        self.enter("unfollow", token).await?;
        let mut state = self.state.lock();
        let before = state.follows.len();
        state.follows.retain(|_, f| f.challenge_id != challenge_id);
        if state.follows.len() == before {
            return Err(missing("follow of", challenge_id));
        }
        Ok(Confirmation::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{challenge, entry};

    #[tokio::test]
    async fn create_assigns_server_ids() {
        let server = FakeServer::new();
        let confirmation = server
            .create_challenge(&challenge("local-1"), "t")
            .await
            .unwrap();
        let record = confirmation.record().unwrap();
        assert_eq!(record.id(), "srv-1");
        assert_eq!(server.challenges().len(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let server = FakeServer::new();
        assert!(matches!(
            server.update_entry(&entry("e-1", "c-1"), "t").await,
            Err(RemoteError::NotFound(_))
        ));
        assert!(matches!(
            server.create_entry(&entry("e-1", "c-1"), "t").await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_payloads_are_rejected() {
        let server = FakeServer::new();
        let mut bad = challenge("local-1");
        bad.target = 0;
        assert!(matches!(
            server.create_challenge(&bad, "t").await,
            Err(RemoteError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn delete_cascades() {
        let server = FakeServer::new();
        let c = server.seed_challenge(challenge("x"));
        server.seed_entry(entry("y", &c.id));
        server.follow(&c.id, "t").await.unwrap();

        server.delete_challenge(&c.id, "t").await.unwrap();
        assert!(server.entries().is_empty());
        assert!(server.follows().is_empty());
    }

    #[tokio::test]
    async fn faults_and_tokens() {
        let server = FakeServer::new();
        server.require_token("good");
        server.fail_next(RemoteError::Server {
            status: 503,
            message: "busy".into(),
        });

        assert!(server.fetch_follows("good").await.unwrap_err().is_transient());
        assert!(matches!(
            server.fetch_follows("bad").await,
            Err(RemoteError::Unauthorized(_))
        ));
        assert!(server.fetch_follows("good").await.is_ok());

        server.set_offline(true);
        assert!(matches!(
            server.fetch_follows("good").await,
            Err(RemoteError::Network(_))
        ));
        assert_eq!(server.calls("fetch_follows"), 4);
    }
}
