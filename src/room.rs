use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

pub type RoomId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub kind: RoomKind,
    pub members: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_member(&self, user: &str) -> bool {
        self.members.contains(user)
    }

    /// Membership check for an identity; anonymous identities never belong to a room.
    pub fn admits(&self, identity: &Identity) -> bool {
        identity.user().is_some_and(|user| self.is_member(user))
    }
}

/// A room that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub name: String,
    pub kind: RoomKind,
    pub members: BTreeSet<String>,
}

impl NewRoom {
    pub fn direct(a: &str, b: &str) -> Result<Self> {
        let members: BTreeSet<String> = [a.to_string(), b.to_string()].into_iter().collect();
        let room = NewRoom {
            name: String::new(),
            kind: RoomKind::Direct,
            members,
        };
        room.validate()?;
        Ok(room)
    }

    pub fn group(name: String, creator: &str, members: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut all: BTreeSet<String> = members.into_iter().filter(|m| !m.trim().is_empty()).collect();
        all.insert(creator.to_string());
        let room = NewRoom {
            name,
            kind: RoomKind::Group,
            members: all,
        };
        room.validate()?;
        Ok(room)
    }

    pub fn validate(&self) -> Result<()> {
        if self.members.iter().any(|m| m.trim().is_empty()) {
            return Err(ChatError::InvalidRoom("member names cannot be blank".to_string()));
        }
        match self.kind {
            RoomKind::Direct if self.members.len() != 2 => Err(ChatError::InvalidRoom(
                "a direct room needs exactly two distinct members".to_string(),
            )),
            RoomKind::Group if self.members.is_empty() => Err(ChatError::InvalidRoom(
                "a group room needs at least one member".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Who owns a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    Anonymous,
}

impl Identity {
    pub fn from_name(name: Option<String>) -> Self {
        match name {
            Some(n) if !n.trim().is_empty() => Identity::User(n),
            _ => Identity::Anonymous,
        }
    }

    pub fn user(&self) -> Option<&str> {
        match self {
            Identity::User(name) => Some(name),
            Identity::Anonymous => None,
        }
    }

    pub fn require_user(&self) -> Result<&str> {
        self.user().ok_or(ChatError::Anonymous)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(name) => f.write_str(name),
            Identity::Anonymous => f.write_str("Anonymous"),
        }
    }
}
