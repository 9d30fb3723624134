//! Pending local changes.

use crate::model::Entity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The server has never seen the entity.
    Create,
    /// The entity changed locally.
    Update,
    /// The entity was deleted locally.
    Delete,
    /// The entity was archived locally.
    Archive,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Archive => "archive",
        };
        f.write_str(name)
    }
}

/// A local mutation the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingChange {
    /// Create the entity.
    Create(String),
    /// Push the entity's current value.
    Update(String),
    /// Delete the entity.
    Delete(String),
    /// Archive the entity.
    Archive(String),
}

impl PendingChange {
    /// Creates a change of the given kind.
    pub fn new(kind: ChangeKind, entity_id: impl Into<String>) -> Self {
        let id = entity_id.into();
        match kind {
            ChangeKind::Create => PendingChange::Create(id),
            ChangeKind::Update => PendingChange::Update(id),
            ChangeKind::Delete => PendingChange::Delete(id),
            ChangeKind::Archive => PendingChange::Archive(id),
        }
    }

    /// Returns the target entity id.
    pub fn entity_id(&self) -> &str {
        match self {
            PendingChange::Create(id)
            | PendingChange::Update(id)
            | PendingChange::Delete(id)
            | PendingChange::Archive(id) => id,
        }
    }

    /// Returns the change kind.
    pub fn kind(&self) -> ChangeKind {
        match self {
            PendingChange::Create(_) => ChangeKind::Create,
            PendingChange::Update(_) => ChangeKind::Update,
            PendingChange::Delete(_) => ChangeKind::Delete,
            PendingChange::Archive(_) => ChangeKind::Archive,
        }
    }

    /// Returns the same change aimed at another id.
    #[must_use]
    pub fn retarget(&self, entity_id: impl Into<String>) -> Self {
        Self::new(self.kind(), entity_id)
    }
}

impl fmt::Display for PendingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.entity_id())
    }
}

/// What the server answered to a successful change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    /// The server's copy of the entity, possibly under a new id.
    Record(Entity),
    /// Plain acknowledgement with no body.
    Ack,
}

impl Confirmation {
    /// Returns the confirmed entity, if the server sent one.
    pub fn record(&self) -> Option<&Entity> {
        match self {
            Confirmation::Record(entity) => Some(entity),
            Confirmation::Ack => None,
        }
    }
}
