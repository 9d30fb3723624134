//! Reconciliation of server snapshots with local state.
//!
//! For every id in the server snapshot or in local scope:
//!
//! 1. a pending local intent keeps the local value (or absence) as is
//! 2. local only, nothing pending: dropped as stale
//! 3. server only: adopted
//! 4. both: the server value is adopted
//!
//! [`merge`] only decides. The caller commits the resulting plan as one
//! storage batch, so an interrupted merge never leaves a half-applied
//! state behind.

use crate::error::SyncResult;
use crate::store::LocalStore;
use std::collections::{BTreeMap, HashSet};
use tally_storage::WriteBatch;
use tally_sync_protocol::{EntityKey, Record};

/// The writes a merge decided on.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan<R> {
    /// Server values to store, new or changed.
    pub upserts: Vec<R>,
    /// Local ids to drop.
    pub removals: Vec<String>,
    /// Ids left alone because a local intent is pending.
    pub kept_pending: usize,
    /// Ids already identical on both sides.
    pub unchanged: usize,
}

impl<R: Record> MergePlan<R> {
    /// Returns true if the plan writes nothing.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    /// Adds the plan's writes to a batch.
    pub fn stage(&self, batch: &mut WriteBatch) -> SyncResult<()> {
        for record in &self.upserts {
            LocalStore::stage_upsert_record(batch, record)?;
        }
        for id in &self.removals {
            LocalStore::stage_delete(batch, &EntityKey::new(R::COLLECTION, id.as_str()));
        }
        Ok(())
    }

    /// Applies the plan to an in-memory view of the collection.
    pub fn apply_to(&self, local: &mut BTreeMap<String, R>) {
        for id in &self.removals {
            local.remove(id);
        }
        for record in &self.upserts {
            local.insert(record.id().to_string(), record.clone());
        }
    }
}

/// Decides how a server snapshot lands on local state.
///
/// `local` is the local records in scope for this snapshot (all of a
/// collection, or one challenge's entries), `pending` the ids with an
/// outstanding ledger entry.
pub fn merge<R: Record>(server: Vec<R>, local: Vec<R>, pending: &HashSet<String>) -> MergePlan<R> {
    let mut local: BTreeMap<String, R> = local
        .into_iter()
        .map(|r| (r.id().to_string(), r))
        .collect();

    let mut plan = MergePlan {
        upserts: Vec::new(),
        removals: Vec::new(),
        kept_pending: 0,
        unchanged: 0,
    };
    let mut seen = HashSet::new();

    for remote in server {
        let id = remote.id().to_string();
        if !seen.insert(id.clone()) {
            continue;
        }
        let existing = local.remove(&id);
        if pending.contains(&id) {
            plan.kept_pending += 1;
        } else if existing.as_ref() == Some(&remote) {
            plan.unchanged += 1;
        } else {
            plan.upserts.push(remote);
        }
    }

    // What is left exists only locally.
    for id in local.into_keys() {
        if pending.contains(&id) {
            plan.kept_pending += 1;
        } else {
            plan.removals.push(id);
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tally_sync_protocol::{Challenge, Timeframe, Visibility};

    fn challenge(id: &str, name: &str) -> Challenge {
        Challenge {
            id: id.into(),
            name: name.into(),
            target: 10,
            timeframe: Timeframe::year(),
            color: "#fff".into(),
            icon: "flag".into(),
            visibility: Visibility::Private,
            archived: false,
            created_at: 0,
        }
    }

    fn as_map(records: &[Challenge]) -> BTreeMap<String, Challenge> {
        records.iter().map(|r| (r.id.clone(), r.clone())).collect()
    }

    fn pending(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pending_create_survives_and_server_record_is_adopted() {
        let local = vec![challenge("local-1", "A")];
        let server = vec![challenge("srv-1", "B")];
        let pending = pending(&["local-1"]);

        let plan = merge(server, local.clone(), &pending);
        let mut state = as_map(&local);
        plan.apply_to(&mut state);

        assert_eq!(
            state,
            as_map(&[challenge("local-1", "A"), challenge("srv-1", "B")])
        );
        assert_eq!(plan.kept_pending, 1);
    }

    #[test]
    fn stale_local_record_is_dropped() {
        let local = vec![challenge("stale-1", "X")];
        let plan = merge(Vec::new(), local.clone(), &HashSet::new());
        let mut state = as_map(&local);
        plan.apply_to(&mut state);
        assert!(state.is_empty());
        assert_eq!(plan.removals, vec!["stale-1".to_string()]);
    }

    #[test]
    fn pending_delete_is_not_readopted() {
        let server = vec![challenge("srv-1", "B")];
        let plan = merge(server, Vec::new(), &pending(&["srv-1"]));
        assert!(plan.is_empty());
    }

    #[test]
    fn server_wins_without_pending_intent() {
        let plan = merge(
            vec![challenge("c", "server")],
            vec![challenge("c", "local")],
            &HashSet::new(),
        );
        assert_eq!(plan.upserts, vec![challenge("c", "server")]);
    }

    #[test]
    fn identical_records_are_not_rewritten() {
        let plan = merge(
            vec![challenge("c", "same")],
            vec![challenge("c", "same")],
            &HashSet::new(),
        );
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged, 1);
    }

    fn arb_challenges() -> impl Strategy<Value = Vec<Challenge>> {
        prop::collection::vec(("[a-f]", "[xyz]"), 0..8).prop_map(|pairs| {
            let mut seen = HashSet::new();
            pairs
                .into_iter()
                .filter(|(id, _)| seen.insert(id.clone()))
                .map(|(id, name)| challenge(&id, &name))
                .collect()
        })
    }

    fn arb_pending() -> impl Strategy<Value = HashSet<String>> {
        prop::collection::hash_set("[a-f]", 0..4)
    }

    proptest! {
        #[test]
        fn pending_ids_are_untouched(
            server in arb_challenges(),
            local in arb_challenges(),
            pending in arb_pending(),
        ) {
            let before = as_map(&local);
            let plan = merge(server, local, &pending);
            let mut after = before.clone();
            plan.apply_to(&mut after);

            for id in &pending {
                prop_assert_eq!(before.get(id), after.get(id));
            }
        }

        #[test]
        fn non_pending_ids_match_server(
            server in arb_challenges(),
            local in arb_challenges(),
            pending in arb_pending(),
        ) {
            let mut after = as_map(&local);
            let plan = merge(server.clone(), local, &pending);
            plan.apply_to(&mut after);

            let server_map = as_map(&server);
            for (id, record) in &server_map {
                if !pending.contains(id) {
                    prop_assert_eq!(after.get(id), Some(record));
                }
            }
            for id in after.keys() {
                prop_assert!(server_map.contains_key(id) || pending.contains(id));
            }
        }

        #[test]
        fn merging_twice_is_idempotent(
            server in arb_challenges(),
            local in arb_challenges(),
            pending in arb_pending(),
        ) {
            let mut once = as_map(&local);
            merge(server.clone(), local, &pending).apply_to(&mut once);

            let mut twice = once.clone();
            let second = merge(server, once.values().cloned().collect(), &pending);
            second.apply_to(&mut twice);

            prop_assert_eq!(&once, &twice);
            prop_assert!(second.is_empty());
        }
    }
}
