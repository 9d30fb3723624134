//! Entity records.

use crate::error::ProtocolResult;
use crate::validate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of ids assigned locally before the server has seen an entity.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Generates a fresh provisional id.
pub fn provisional_id() -> String {
    format!("{PROVISIONAL_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Returns true if `id` was assigned locally.
pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// One of the three entity collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    /// Challenges.
    Challenges,
    /// Entries logged against a challenge.
    Entries,
    /// Followed public challenges.
    Follows,
}

impl Collection {
    /// Every collection, in parent-before-child order.
    pub const ALL: [Collection; 3] = [
        Collection::Challenges,
        Collection::Entries,
        Collection::Follows,
    ];

    /// Returns the storage table holding this collection.
    pub fn table(self) -> &'static str {
        match self {
            Collection::Challenges => "challenges",
            Collection::Entries => "entries",
            Collection::Follows => "follows",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Fully qualified entity address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Collection the entity lives in.
    pub collection: Collection,
    /// Entity id.
    pub id: String,
}

impl EntityKey {
    /// Creates a key.
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Period a challenge counts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeframeUnit {
    /// A calendar year.
    Year,
    /// A calendar month.
    Month,
    /// Explicit start and end dates.
    Custom,
}

/// Challenge timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    /// Unit of the timeframe.
    pub unit: TimeframeUnit,
    /// First day, `YYYY-MM-DD`.
    pub start_date: Option<String>,
    /// Last day, `YYYY-MM-DD`.
    pub end_date: Option<String>,
}

impl Timeframe {
    /// A whole-year timeframe.
    pub fn year() -> Self {
        Self {
            unit: TimeframeUnit::Year,
            start_date: None,
            end_date: None,
        }
    }

    /// A custom date range.
    pub fn custom(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            unit: TimeframeUnit::Custom,
            start_date: Some(start.into()),
            end_date: Some(end.into()),
        }
    }
}

/// Who can see a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    /// Only the owner.
    #[default]
    Private,
    /// Anyone; can be followed.
    Public,
}

/// How hard an entry felt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feeling {
    /// Very easy.
    VeryEasy,
    /// Easy.
    Easy,
    /// Moderate.
    Moderate,
    /// Hard.
    Hard,
    /// Very hard.
    VeryHard,
}

/// A counted goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Entity id.
    pub id: String,
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
    /// Whether the challenge is archived.
    pub archived: bool,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// One set within an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySet {
    /// Repetitions.
    pub reps: u32,
}

/// A logged amount on a given day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entity id.
    pub id: String,
    /// Owning challenge.
    pub challenge_id: String,
    /// Day, `YYYY-MM-DD`.
    pub date: String,
    /// Logged count.
    pub count: u32,
    /// Optional note.
    pub note: Option<String>,
    /// Optional breakdown into sets.
    pub sets: Vec<EntrySet>,
    /// Optional effort rating.
    pub feeling: Option<Feeling>,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// A followed public challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    /// Entity id.
    pub id: String,
    /// Followed challenge.
    pub challenge_id: String,
    /// When the follow happened, milliseconds since the Unix epoch.
    pub followed_at: u64,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// An entity of any collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    /// A challenge.
    Challenge(Challenge),
    /// An entry.
    Entry(Entry),
    /// A follow.
    Follow(Follow),
}

impl Entity {
    /// Returns the entity id.
    pub fn id(&self) -> &str {
        match self {
            Entity::Challenge(c) => &c.id,
            Entity::Entry(e) => &e.id,
            Entity::Follow(f) => &f.id,
        }
    }

    /// Returns the collection the entity belongs to.
    pub fn collection(&self) -> Collection {
        match self {
            Entity::Challenge(_) => Collection::Challenges,
            Entity::Entry(_) => Collection::Entries,
            Entity::Follow(_) => Collection::Follows,
        }
    }

    /// Returns the entity's key.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.collection(), self.id())
    }

    /// Replaces the entity id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        match self {
            Entity::Challenge(c) => c.set_id(id),
            Entity::Entry(e) => e.set_id(id),
            Entity::Follow(f) => f.set_id(id),
        }
    }

    /// Returns the parent challenge id for entries and follows.
    pub fn challenge_id(&self) -> Option<&str> {
        match self {
            Entity::Challenge(_) => None,
            Entity::Entry(e) => Some(&e.challenge_id),
            Entity::Follow(f) => Some(&f.challenge_id),
        }
    }

    /// Points the entity at `new` if it references challenge `old`.
    ///
    /// Returns true if anything changed.
    pub fn rewrite_challenge_id(&mut self, old: &str, new: &str) -> bool {
        let parent = match self {
            Entity::Challenge(_) => return false,
            Entity::Entry(e) => &mut e.challenge_id,
            Entity::Follow(f) => &mut f.challenge_id,
        };
        if parent.as_str() == old {
            *parent = new.to_string();
            true
        } else {
            false
        }
    }

    /// Validates the payload.
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            Entity::Challenge(c) => c.validate(),
            Entity::Entry(e) => e.validate(),
            Entity::Follow(f) => f.validate(),
        }
    }
}

/// A storable entity type.
pub trait Record:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Collection this type is stored in.
    const COLLECTION: Collection;

    /// Returns the entity id.
    fn id(&self) -> &str;

    /// Replaces the entity id.
    fn set_id(&mut self, id: String);

    /// Checks the payload against local validation rules.
    fn validate(&self) -> ProtocolResult<()>;

    /// Wraps the record.
    fn into_entity(self) -> Entity;

    /// Unwraps a record of this type.
    fn from_entity(entity: Entity) -> Option<Self>;
}

impl Record for Challenge {
    const COLLECTION: Collection = Collection::Challenges;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> ProtocolResult<()> {
        validate::challenge(self)
    }

    fn into_entity(self) -> Entity {
        Entity::Challenge(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Challenge(c) => Some(c),
            _ => None,
        }
    }
}

impl Record for Entry {
    const COLLECTION: Collection = Collection::Entries;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> ProtocolResult<()> {
        validate::entry(self)
    }

    fn into_entity(self) -> Entity {
        Entity::Entry(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Entry(e) => Some(e),
            _ => None,
        }
    }
}

impl Record for Follow {
    const COLLECTION: Collection = Collection::Follows;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> ProtocolResult<()> {
        validate::follow(self)
    }

    fn into_entity(self) -> Entity {
        Entity::Follow(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Follow(f) => Some(f),
            _ => None,
        }
    }
}
