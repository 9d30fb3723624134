//! Remote API abstraction.

use crate::error::SyncError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tally_sync_protocol::{Challenge, Confirmation, Entry, Follow, Record};
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// How a remote call failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The server could not be reached, or the call timed out.
    #[error("network error: {0}")]
    Network(String),
    /// The bearer credential was missing or refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The server refused the payload.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The referenced entity does not exist on the server.
    #[error("not found: {0}")]
    NotFound(String),
    /// The referenced entity was deleted on the server.
    #[error("gone: {0}")]
    Gone(String),
    /// The server failed; worth retrying.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Error message.
        message: String,
    },
}

impl RemoteError {
    /// Classifies an HTTP error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => RemoteError::Unauthorized(message),
            404 => RemoteError::NotFound(message),
            410 => RemoteError::Gone(message),
            408 | 429 | 500..=599 => RemoteError::Server { status, message },
            _ => RemoteError::Rejected(message),
        }
    }

    /// Returns true if the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Server { .. })
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(message) => SyncError::Network { message },
            RemoteError::Unauthorized(message) => SyncError::AuthRequired { message },
            RemoteError::Rejected(message) => SyncError::Validation { message },
            RemoteError::NotFound(message) | RemoteError::Gone(message) => {
                SyncError::Conflict { message }
            }
            RemoteError::Server { .. } => SyncError::Remote {
                message: err.to_string(),
            },
        }
    }
}

/// The server as seen by the sync engine.
///
/// Implementations are transport-agnostic; every call carries the bearer
/// credential. Mutations answer with the server's copy of the entity or
/// a bare acknowledgement.
#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    /// Fetches the caller's challenges.
    async fn fetch_challenges(&self, token: &str) -> RemoteResult<Vec<Challenge>>;

    /// Fetches the entries of one challenge.
    async fn fetch_entries(&self, challenge_id: &str, token: &str) -> RemoteResult<Vec<Entry>>;

    /// Fetches the caller's follows.
    async fn fetch_follows(&self, token: &str) -> RemoteResult<Vec<Follow>>;

    /// Creates a challenge.
    async fn create_challenge(&self, challenge: &Challenge, token: &str)
        -> RemoteResult<Confirmation>;

    /// Updates a challenge.
    async fn update_challenge(&self, challenge: &Challenge, token: &str)
        -> RemoteResult<Confirmation>;

    /// Deletes a challenge and everything under it.
    async fn delete_challenge(&self, id: &str, token: &str) -> RemoteResult<Confirmation>;

    /// Archives a challenge, storing the given fields with it.
    async fn archive_challenge(&self, challenge: &Challenge, token: &str)
        -> RemoteResult<Confirmation>;

    /// Creates an entry.
    async fn create_entry(&self, entry: &Entry, token: &str) -> RemoteResult<Confirmation>;

    /// Updates an entry.
    async fn update_entry(&self, entry: &Entry, token: &str) -> RemoteResult<Confirmation>;

    /// Deletes an entry.
    async fn delete_entry(&self, id: &str, token: &str) -> RemoteResult<Confirmation>;

    /// Follows a public challenge.
    async fn follow(&self, challenge_id: &str, token: &str) -> RemoteResult<Confirmation>;

    /// Stops following a challenge.
    async fn unfollow(&self, challenge_id: &str, token: &str) -> RemoteResult<Confirmation>;
}

#[async_trait]
impl<T: RemoteApi + ?Sized> RemoteApi for Arc<T> {
    async fn fetch_challenges(&self, token: &str) -> RemoteResult<Vec<Challenge>> {
        (**self).fetch_challenges(token).await
    }

    async fn fetch_entries(&self, challenge_id: &str, token: &str) -> RemoteResult<Vec<Entry>> {
        (**self).fetch_entries(challenge_id, token).await
    }

    async fn fetch_follows(&self, token: &str) -> RemoteResult<Vec<Follow>> {
        (**self).fetch_follows(token).await
    }

    async fn create_challenge(
        &self,
        challenge: &Challenge,
        token: &str,
    ) -> RemoteResult<Confirmation> {
        (**self).create_challenge(challenge, token).await
    }

    async fn update_challenge(
        &self,
        challenge: &Challenge,
        token: &str,
    ) -> RemoteResult<Confirmation> {
        (**self).update_challenge(challenge, token).await
    }

    async fn delete_challenge(&self, id: &str, token: &str) -> RemoteResult<Confirmation> {
        (**self).delete_challenge(id, token).await
    }

    async fn archive_challenge(
        &self,
        challenge: &Challenge,
        token: &str,
    ) -> RemoteResult<Confirmation> {
        (**self).archive_challenge(challenge, token).await
    }

    async fn create_entry(&self, entry: &Entry, token: &str) -> RemoteResult<Confirmation> {
        (**self).create_entry(entry, token).await
    }

    async fn update_entry(&self, entry: &Entry, token: &str) -> RemoteResult<Confirmation> {
        (**self).update_entry(entry, token).await
    }

    async fn delete_entry(&self, id: &str, token: &str) -> RemoteResult<Confirmation> {
        (**self).delete_entry(id, token).await
    }

    async fn follow(&self, challenge_id: &str, token: &str) -> RemoteResult<Confirmation> {
        (**self).follow(challenge_id, token).await
    }

    async fn unfollow(&self, challenge_id: &str, token: &str) -> RemoteResult<Confirmation> {
        (**self).unfollow(challenge_id, token).await
    }
}

/// A scripted remote for tests.
///
/// Fetches return the configured snapshots. Mutations pop the next
/// scripted response, or echo the payload back when the script is empty.
/// Every call is logged as `"<operation> <id>"`.
#[derive(Debug, Default)]
pub struct MockRemote {
    challenges: Mutex<Vec<Challenge>>,
    entries: Mutex<Vec<Entry>>,
    follows: Mutex<Vec<Follow>>,
    fetch_error: Mutex<Option<RemoteError>>,
    responses: Mutex<VecDeque<RemoteResult<Confirmation>>>,
    calls: Mutex<Vec<String>>,
}

impl MockRemote {
    /// Creates a mock with empty snapshots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the challenge snapshot.
    pub fn set_challenges(&self, challenges: Vec<Challenge>) {
        *self.challenges.lock() = challenges;
    }

    /// Sets the entry snapshot, shared by every challenge.
    pub fn set_entries(&self, entries: Vec<Entry>) {
        *self.entries.lock() = entries;
    }

    /// Sets the follow snapshot.
    pub fn set_follows(&self, follows: Vec<Follow>) {
        *self.follows.lock() = follows;
    }

    /// Makes every fetch fail with `error` until cleared.
    pub fn set_fetch_error(&self, error: Option<RemoteError>) {
        *self.fetch_error.lock() = error;
    }

    /// Queues the response for the next mutation.
    pub fn push_response(&self, response: RemoteResult<Confirmation>) {
        self.responses.lock().push_back(response);
    }

    /// Returns the calls made so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn log(&self, operation: &str, id: &str) {
        self.calls.lock().push(format!("{operation} {id}"));
    }

    fn fetch<T: Clone>(&self, operation: &str, source: &Mutex<Vec<T>>) -> RemoteResult<Vec<T>> {
        self.log(operation, "*");
        match self.fetch_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(source.lock().clone()),
        }
    }

    fn respond<R: Record>(&self, operation: &str, record: Option<&R>, id: &str) -> RemoteResult<Confirmation> {
        self.log(operation, id);
        match self.responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(record
                .map(|r| Confirmation::Record(r.clone().into_entity()))
                .unwrap_or(Confirmation::Ack)),
        }
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn fetch_challenges(&self, _token: &str) -> RemoteResult<Vec<Challenge>> {
        self.fetch("fetch_challenges", &self.challenges)
    }

    async fn fetch_entries(&self, challenge_id: &str, _token: &str) -> RemoteResult<Vec<Entry>> {
        let entries = self.fetch("fetch_entries", &self.entries)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.challenge_id == challenge_id)
            .collect())
    }

    async fn fetch_follows(&self, _token: &str) -> RemoteResult<Vec<Follow>> {
        self.fetch("fetch_follows", &self.follows)
    }

    async fn create_challenge(
        &self,
        challenge: &Challenge,
        _token: &str,
    ) -> RemoteResult<Confirmation> {
        self.respond("create_challenge", Some(challenge), &challenge.id)
    }

    async fn update_challenge(
        &self,
        challenge: &Challenge,
        _token: &str,
    ) -> RemoteResult<Confirmation> {
        self.respond("update_challenge", Some(challenge), &challenge.id)
    }

    async fn delete_challenge(&self, id: &str, _token: &str) -> RemoteResult<Confirmation> {
        self.respond::<Challenge>("delete_challenge", None, id)
    }

    async fn archive_challenge(
        &self,
        challenge: &Challenge,
        _token: &str,
    ) -> RemoteResult<Confirmation> {
        self.respond("archive_challenge", Some(challenge), &challenge.id)
    }

    async fn create_entry(&self, entry: &Entry, _token: &str) -> RemoteResult<Confirmation> {
        self.respond("create_entry", Some(entry), &entry.id)
    }

    async fn update_entry(&self, entry: &Entry, _token: &str) -> RemoteResult<Confirmation> {
        self.respond("update_entry", Some(entry), &entry.id)
    }

    async fn delete_entry(&self, id: &str, _token: &str) -> RemoteResult<Confirmation> {
        self.respond::<Entry>("delete_entry", None, id)
    }

    async fn follow(&self, challenge_id: &str, _token: &str) -> RemoteResult<Confirmation> {
        self.respond::<Follow>("follow", None, challenge_id)
    }

    async fn unfollow(&self, challenge_id: &str, _token: &str) -> RemoteResult<Confirmation> {
        self.respond::<Follow>("unfollow", None, challenge_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            RemoteError::from_status(401, "expired"),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            RemoteError::from_status(422, "bad"),
            RemoteError::Rejected(_)
        ));
        assert!(matches!(
            RemoteError::from_status(400, "bad"),
            RemoteError::Rejected(_)
        ));
        assert!(matches!(
            RemoteError::from_status(404, "missing"),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            RemoteError::from_status(410, "deleted"),
            RemoteError::Gone(_)
        ));
        assert!(RemoteError::from_status(503, "busy").is_transient());
        assert!(RemoteError::from_status(429, "slow down").is_transient());
        assert!(!RemoteError::from_status(403, "forbidden").is_transient());
    }

    #[test]
    fn sync_error_mapping() {
        let err: SyncError = RemoteError::Unauthorized("expired".into()).into();
        assert!(matches!(err, SyncError::AuthRequired { .. }));

        let err: SyncError = RemoteError::Gone("deleted".into()).into();
        assert!(matches!(err, SyncError::Conflict { .. }));

        let err: SyncError = RemoteError::from_status(500, "oops").into();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn mock_remote_scripts_and_logs() {
        let remote = MockRemote::new();
        remote.push_response(Err(RemoteError::Network("down".into())));

        assert!(remote.delete_entry("e-1", "t").await.is_err());
        assert_eq!(
            remote.delete_entry("e-1", "t").await.unwrap(),
            Confirmation::Ack
        );
        assert_eq!(remote.calls(), vec!["delete_entry e-1", "delete_entry e-1"]);
    }

    #[tokio::test]
    async fn mock_remote_fetch_error() {
        let remote = MockRemote::new();
        remote.set_fetch_error(Some(RemoteError::Network("offline".into())));
        assert!(remote.fetch_follows("t").await.is_err());
        remote.set_fetch_error(None);
        assert!(remote.fetch_follows("t").await.unwrap().is_empty());
    }
}
