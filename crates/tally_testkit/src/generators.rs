//! Property-based test generators using proptest.
//!
//! Strategies here only produce values that pass local validation, so a
//! generated operation fails only for the reason a test is probing.

use proptest::prelude::*;
use tally_sync_engine::{NewChallenge, NewEntry, RemoteApi, SyncCoordinator, SyncResult};
use tally_sync_protocol::{Entry, EntrySet, Feeling, Timeframe, Visibility};

/// Strategy for valid challenge names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{0,11}( [a-z]{1,8}){0,2}").expect("Invalid regex")
}

/// Strategy for valid `YYYY-MM-DD` dates.
pub fn date_strategy() -> impl Strategy<Value = String> {
    (2020u32..2031, 1u32..=12, 1u32..=28).prop_map(|(y, m, d)| format!("{y:04}-{m:02}-{d:02}"))
}

/// Strategy for valid hex colors.
pub fn color_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::string::string_regex("#[0-9a-f]{3}").expect("Invalid regex"),
        prop::string::string_regex("#[0-9A-F]{6}").expect("Invalid regex"),
    ]
}

/// Strategy for valid timeframes.
pub fn timeframe_strategy() -> impl Strategy<Value = Timeframe> {
    prop_oneof![
        Just(Timeframe::year()),
        (date_strategy(), date_strategy()).prop_map(|(a, b)| {
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            Timeframe::custom(start, end)
        }),
    ]
}

/// Strategy for effort ratings.
pub fn feeling_strategy() -> impl Strategy<Value = Feeling> {
    prop_oneof![
        Just(Feeling::VeryEasy),
        Just(Feeling::Easy),
        Just(Feeling::Moderate),
        Just(Feeling::Hard),
        Just(Feeling::VeryHard),
    ]
}

/// Strategy for challenge drafts.
pub fn new_challenge_strategy() -> impl Strategy<Value = NewChallenge> {
    (
        name_strategy(),
        1u32..10_000,
        color_strategy(),
        prop::sample::select(vec!["flag", "book", "run", "leaf"]),
        timeframe_strategy(),
        any::<bool>(),
    )
        .prop_map(|(name, target, color, icon, timeframe, public)| {
            let visibility = if public {
                Visibility::Public
            } else {
                Visibility::Private
            };
            NewChallenge::new(name, target, color, icon)
                .with_timeframe(timeframe)
                .with_visibility(visibility)
        })
}

/// One user action or sync request, addressed by index into the
/// client's current state so any sequence is meaningful.
#[derive(Debug, Clone)]
pub enum ClientOp {
    /// Create a challenge.
    CreateChallenge(NewChallenge),
    /// Rename the n-th challenge.
    RenameChallenge {
        /// Index, wrapped around.
        index: usize,
        /// New name.
        name: String,
    },
    /// Archive the n-th challenge.
    ArchiveChallenge {
        /// Index, wrapped around.
        index: usize,
    },
    /// Delete the n-th challenge.
    DeleteChallenge {
        /// Index, wrapped around.
        index: usize,
    },
    /// Log an entry on the n-th challenge.
    AddEntry {
        /// Index, wrapped around.
        index: usize,
        /// Day.
        date: String,
        /// Count.
        count: u32,
        /// Optional effort rating.
        feeling: Option<Feeling>,
    },
    /// Change the count of the n-th entry.
    UpdateEntry {
        /// Index, wrapped around.
        index: usize,
        /// New count.
        count: u32,
    },
    /// Delete the n-th entry.
    DeleteEntry {
        /// Index, wrapped around.
        index: usize,
    },
    /// Follow the n-th challenge.
    Follow {
        /// Index, wrapped around.
        index: usize,
    },
    /// Drop the n-th follow.
    Unfollow {
        /// Index, wrapped around.
        index: usize,
    },
    /// Refresh, then drain.
    Sync,
}

/// Strategy for a single client operation.
pub fn client_op_strategy() -> impl Strategy<Value = ClientOp> {
    let index = 0usize..16;
    prop_oneof![
        3 => new_challenge_strategy().prop_map(ClientOp::CreateChallenge),
        1 => (index.clone(), name_strategy())
            .prop_map(|(index, name)| ClientOp::RenameChallenge { index, name }),
        1 => index.clone().prop_map(|index| ClientOp::ArchiveChallenge { index }),
        1 => index.clone().prop_map(|index| ClientOp::DeleteChallenge { index }),
        3 => (index.clone(), date_strategy(), 1u32..500, prop::option::of(feeling_strategy()))
            .prop_map(|(index, date, count, feeling)| ClientOp::AddEntry {
                index,
                date,
                count,
                feeling,
            }),
        1 => (index.clone(), 1u32..500)
            .prop_map(|(index, count)| ClientOp::UpdateEntry { index, count }),
        1 => index.clone().prop_map(|index| ClientOp::DeleteEntry { index }),
        1 => index.clone().prop_map(|index| ClientOp::Follow { index }),
        1 => index.prop_map(|index| ClientOp::Unfollow { index }),
        1 => Just(ClientOp::Sync),
    ]
}

/// Strategy for sequences of up to `max` operations.
pub fn client_ops_strategy(max: usize) -> impl Strategy<Value = Vec<ClientOp>> {
    prop::collection::vec(client_op_strategy(), 0..=max)
}

fn pick<T>(items: Vec<T>, index: usize) -> Option<T> {
    if items.is_empty() {
        None
    } else {
        let at = index % items.len();
        items.into_iter().nth(at)
    }
}

impl ClientOp {
    /// Applies the operation. Index-based operations on empty state do
    /// nothing.
    pub async fn apply<R: RemoteApi>(&self, client: &SyncCoordinator<R>) -> SyncResult<()> {
        match self {
            ClientOp::CreateChallenge(draft) => {
                client.create_challenge(draft.clone())?;
            }
            ClientOp::RenameChallenge { index, name } => {
                if let Some(mut challenge) = pick(client.challenges()?, *index) {
                    challenge.name = name.clone();
                    client.update_challenge(challenge)?;
                }
            }
            ClientOp::ArchiveChallenge { index } => {
                if let Some(challenge) = pick(client.challenges()?, *index) {
                    client.archive_challenge(&challenge.id)?;
                }
            }
            ClientOp::DeleteChallenge { index } => {
                if let Some(challenge) = pick(client.challenges()?, *index) {
                    client.delete_challenge(&challenge.id)?;
                }
            }
            ClientOp::AddEntry {
                index,
                date,
                count,
                feeling,
            } => {
                if let Some(challenge) = pick(client.challenges()?, *index) {
                    let mut draft = NewEntry::new(challenge.id, date.clone(), *count)
                        .with_sets(vec![EntrySet { reps: *count }]);
                    if let Some(feeling) = feeling {
                        draft = draft.with_feeling(*feeling);
                    }
                    client.add_entry(draft)?;
                }
            }
            ClientOp::UpdateEntry { index, count } => {
                if let Some(mut entry) = pick(client.store().list_all::<Entry>()?, *index) {
                    entry.count = *count;
                    client.update_entry(entry)?;
                }
            }
            ClientOp::DeleteEntry { index } => {
                if let Some(entry) = pick(client.store().list_all::<Entry>()?, *index) {
                    client.delete_entry(&entry.id)?;
                }
            }
            ClientOp::Follow { index } => {
                if let Some(challenge) = pick(client.challenges()?, *index) {
                    client.follow(&challenge.id)?;
                }
            }
            ClientOp::Unfollow { index } => {
                if let Some(follow) = pick(client.follows()?, *index) {
                    client.unfollow(&follow.challenge_id)?;
                }
            }
            ClientOp::Sync => {
                client.sync().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_sync_protocol::{is_valid_color, is_valid_date, Challenge, Record};

    proptest! {
        #[test]
        fn generated_dates_are_valid(date in date_strategy()) {
            prop_assert!(is_valid_date(&date));
        }

        #[test]
        fn generated_colors_are_valid(color in color_strategy()) {
            prop_assert!(is_valid_color(&color));
        }

        #[test]
        fn generated_drafts_validate(draft in new_challenge_strategy()) {
            let challenge = Challenge {
                id: "c".into(),
                name: draft.name,
                target: draft.target,
                timeframe: draft.timeframe,
                color: draft.color,
                icon: draft.icon,
                visibility: draft.visibility,
                archived: false,
                created_at: 0,
            };
            prop_assert!(challenge.validate().is_ok());
        }
    }

    #[test]
    fn pick_wraps_around() {
        assert_eq!(pick(vec![1, 2, 3], 4), Some(2));
        assert_eq!(pick(Vec::<u8>::new(), 4), None);
    }
}
