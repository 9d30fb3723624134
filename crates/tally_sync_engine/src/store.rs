//! Durable entity cache.

use crate::error::SyncResult;
use std::sync::Arc;
use tally_storage::{KvLog, WriteBatch};
use tally_sync_protocol::{
    from_cbor, to_cbor, Challenge, Collection, Entity, EntityKey, Entry, Follow, Record,
};

/// Crash-safe storage of the three entity collections.
///
/// Each collection is a table keyed by entity id. Writes are idempotent
/// and the last writer for an id wins. Methods that commit on their own
/// are public; the `stage_*` variants add to a caller's batch so several
/// tables can change atomically.
#[derive(Clone)]
pub struct LocalStore {
    log: Arc<KvLog>,
}

impl LocalStore {
    /// Creates a store on top of a log.
    pub fn new(log: Arc<KvLog>) -> Self {
        Self { log }
    }

    /// Returns every record of a collection, ordered by id.
    pub fn list_all<R: Record>(&self) -> SyncResult<Vec<R>> {
        self.log
            .scan(R::COLLECTION.table())
            .into_iter()
            .map(|(_, bytes)| Ok(from_cbor(&bytes)?))
            .collect()
    }

    /// Returns every entity of a collection.
    pub fn list_entities(&self, collection: Collection) -> SyncResult<Vec<Entity>> {
        Ok(match collection {
            Collection::Challenges => into_entities(self.list_all::<Challenge>()?),
            Collection::Entries => into_entities(self.list_all::<Entry>()?),
            Collection::Follows => into_entities(self.list_all::<Follow>()?),
        })
    }

    /// Looks up a record. A missing id is `Ok(None)`.
    pub fn get<R: Record>(&self, id: &str) -> SyncResult<Option<R>> {
        match self.log.get(R::COLLECTION.table(), id) {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Looks up an entity of any collection.
    pub fn get_entity(&self, key: &EntityKey) -> SyncResult<Option<Entity>> {
        Ok(match key.collection {
            Collection::Challenges => self.get::<Challenge>(&key.id)?.map(Record::into_entity),
            Collection::Entries => self.get::<Entry>(&key.id)?.map(Record::into_entity),
            Collection::Follows => self.get::<Follow>(&key.id)?.map(Record::into_entity),
        })
    }

    /// Returns true if the entity exists.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.log.contains(key.collection.table(), &key.id)
    }

    /// Returns the number of records in a collection.
    pub fn count(&self, collection: Collection) -> usize {
        self.log.row_count(collection.table())
    }

    /// Inserts or replaces one record.
    pub fn upsert_one<R: Record>(&self, record: &R) -> SyncResult<()> {
        self.upsert_many(std::slice::from_ref(record))
    }

    /// Inserts or replaces many records in one atomic write.
    pub fn upsert_many<R: Record>(&self, records: &[R]) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        for record in records {
            Self::stage_upsert_record(&mut batch, record)?;
        }
        self.log.write(batch)?;
        Ok(())
    }

    /// Removes a record. Returns false if it did not exist.
    pub fn delete(&self, key: &EntityKey) -> SyncResult<bool> {
        if !self.contains(key) {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        Self::stage_delete(&mut batch, key);
        self.log.write(batch)?;
        Ok(true)
    }

    /// Removes every record of every collection.
    pub fn clear(&self) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        Self::stage_clear(&mut batch);
        self.log.write(batch)?;
        Ok(())
    }

    /// Returns the entries of one challenge.
    pub fn entries_for(&self, challenge_id: &str) -> SyncResult<Vec<Entry>> {
        Ok(self
            .list_all::<Entry>()?
            .into_iter()
            .filter(|e| e.challenge_id == challenge_id)
            .collect())
    }

    /// Returns the entries and follows pointing at a challenge.
    pub(crate) fn children_of(&self, challenge_id: &str) -> SyncResult<Vec<Entity>> {
        let follows = self
            .list_all::<Follow>()?
            .into_iter()
            .filter(|f| f.challenge_id == challenge_id)
            .map(Record::into_entity);
        let mut children = into_entities(self.entries_for(challenge_id)?);
        children.extend(follows);
        Ok(children)
    }

    pub(crate) fn stage_upsert_record<R: Record>(
        batch: &mut WriteBatch,
        record: &R,
    ) -> SyncResult<()> {
        batch.put(R::COLLECTION.table(), record.id(), to_cbor(record)?);
        Ok(())
    }

    pub(crate) fn stage_upsert(batch: &mut WriteBatch, entity: &Entity) -> SyncResult<()> {
        match entity {
            Entity::Challenge(c) => Self::stage_upsert_record(batch, c),
            Entity::Entry(e) => Self::stage_upsert_record(batch, e),
            Entity::Follow(f) => Self::stage_upsert_record(batch, f),
        }
    }

    pub(crate) fn stage_delete(batch: &mut WriteBatch, key: &EntityKey) {
        batch.delete(key.collection.table(), key.id.as_str());
    }

    /// Stages removal of every stored entity into `batch`.
    pub fn stage_clear(batch: &mut WriteBatch) {
        for collection in Collection::ALL {
            batch.clear_table(collection.table());
        }
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

fn into_entities<R: Record>(records: Vec<R>) -> Vec<Entity> {
    records.into_iter().map(Record::into_entity).collect()
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_storage::InMemoryBackend;
    use tally_sync_protocol::{Timeframe, Visibility};

    fn store() -> LocalStore {
        let log = KvLog::open(Box::new(InMemoryBackend::new())).unwrap();
        LocalStore::new(Arc::new(log))
    }

    fn challenge(id: &str, name: &str) -> Challenge {
        Challenge {
            id: id.into(),
            name: name.into(),
            target: 100,
            timeframe: Timeframe::year(),
            color: "#123".into(),
            icon: "star".into(),
            visibility: Visibility::Private,
            archived: false,
            created_at: 1,
        }
    }

    fn entry(id: &str, challenge_id: &str) -> Entry {
        Entry {
            id: id.into(),
            challenge_id: challenge_id.into(),
            date: "2026-05-01".into(),
            count: 3,
            note: None,
            sets: vec![],
            feeling: None,
            created_at: 1,
        }
    }

    #[test]
    fn get_missing_is_none() {
        let store = store();
        assert_eq!(store.get::<Challenge>("nope").unwrap(), None);
    }

    #[test]
    fn upsert_is_idempotent_and_last_writer_wins() {
        let store = store();
        store.upsert_one(&challenge("c-1", "first")).unwrap();
        store.upsert_one(&challenge("c-1", "first")).unwrap();
        assert_eq!(store.count(Collection::Challenges), 1);

        store.upsert_one(&challenge("c-1", "second")).unwrap();
        let stored: Challenge = store.get("c-1").unwrap().unwrap();
        assert_eq!(stored.name, "second");
    }

    #[test]
    fn upsert_many_and_list() {
        let store = store();
        store
            .upsert_many(&[challenge("b", "B"), challenge("a", "A")])
            .unwrap();
        let ids: Vec<_> = store
            .list_all::<Challenge>()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn collections_are_separate() {
        let store = store();
        store.upsert_one(&challenge("x", "c")).unwrap();
        store.upsert_one(&entry("x", "c-9")).unwrap();
        assert_eq!(store.count(Collection::Challenges), 1);
        assert_eq!(store.count(Collection::Entries), 1);

        let key = EntityKey::new(Collection::Entries, "x");
        assert!(matches!(
            store.get_entity(&key).unwrap(),
            Some(Entity::Entry(_))
        ));
    }

    #[test]
    fn delete_and_clear() {
        let store = store();
        store.upsert_one(&challenge("c-1", "c")).unwrap();
        store.upsert_one(&entry("e-1", "c-1")).unwrap();

        let key = EntityKey::new(Collection::Challenges, "c-1");
        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());

        store.clear().unwrap();
        assert_eq!(store.count(Collection::Entries), 0);
    }

    #[test]
    fn children_of_challenge() {
        let store = store();
        store.upsert_one(&entry("e-1", "c-1")).unwrap();
        store.upsert_one(&entry("e-2", "c-2")).unwrap();
        store
            .upsert_one(&Follow {
                id: "f-1".into(),
                challenge_id: "c-1".into(),
                followed_at: 0,
                created_at: 0,
            })
            .unwrap();

        let keys: Vec<_> = store
            .children_of("c-1")
            .unwrap()
            .iter()
            .map(|e| e.key().to_string())
            .collect();
        assert_eq!(keys, vec!["entries/e-1", "follows/f-1"]);
    }
}
