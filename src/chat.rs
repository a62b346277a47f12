//! Durable chat messages and the visibility rules applied to their media.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::moderation::{ModerationVerdict, VerdictStatus};
use crate::room::RoomId;

pub type MessageId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    File,
    Voice,
}

impl MediaKind {
    /// Only pictures and videos go through the classifier.
    pub fn is_moderated(self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::File => "file",
            MediaKind::Voice => "voice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "file" => Some(MediaKind::File),
            "voice" => Some(MediaKind::Voice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: MediaKind,
    /// Storage reference (path or URL) of the uploaded media.
    pub reference: String,
    /// `None` for media kinds that are never moderated.
    pub verdict: Option<ModerationVerdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender: String,
    pub content: Option<String>,
    pub media: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub reply_to: Option<MessageId>,
    /// Matches the `delivery_id` of the live event that announced this message.
    pub delivery_id: Option<Uuid>,
}

impl Message {
    pub fn attachment(&self, kind: MediaKind) -> Option<&Attachment> {
        self.media.iter().find(|a| a.kind == kind)
    }

    /// Whether `viewer` may see this message.
    ///
    /// Authors always see their own messages. Everyone else loses sight of a
    /// message as soon as one of its moderated attachments is rejected or
    /// failed classification; pending media follows `pending_visible`.
    pub fn visible_to(&self, viewer: &str, pending_visible: bool) -> bool {
        if self.sender == viewer {
            return true;
        }
        self.media.iter().all(|attachment| match &attachment.verdict {
            None => true,
            Some(verdict) => match verdict.status {
                VerdictStatus::Approved => true,
                VerdictStatus::Pending => pending_visible,
                VerdictStatus::Rejected | VerdictStatus::Error => false,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaUpload {
    pub kind: MediaKind,
    pub reference: String,
}

/// A message on its way into storage.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender: String,
    pub content: Option<String>,
    pub media: Vec<MediaUpload>,
    pub reply_to: Option<MessageId>,
    pub delivery_id: Option<Uuid>,
}

impl NewMessage {
    pub fn text(room_id: RoomId, sender: impl Into<String>, content: impl Into<String>) -> Self {
        NewMessage {
            room_id,
            sender: sender.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Drops blank text and blank media references, then enforces that
    /// something is left and that each media kind appears at most once.
    pub fn normalize(mut self) -> Result<Self> {
        self.content = self.content.filter(|c| !c.trim().is_empty());
        self.media.retain(|m| !m.reference.trim().is_empty());
        if self.content.is_none() && self.media.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        for (i, upload) in self.media.iter().enumerate() {
            if self.media[..i].iter().any(|m| m.kind == upload.kind) {
                return Err(ChatError::InvalidMessage(format!(
                    "only one {} attachment per message",
                    upload.kind.as_str()
                )));
            }
        }
        Ok(self)
    }

    /// Converts uploads into stored attachments, marking moderated kinds pending.
    pub fn attachments(&self) -> Vec<Attachment> {
        self.media
            .iter()
            .map(|upload| Attachment {
                kind: upload.kind,
                reference: upload.reference.clone(),
                verdict: upload.kind.is_moderated().then(ModerationVerdict::pending),
            })
            .collect()
    }
}

/// Used when a reaction request names none.
pub const DEFAULT_REACTION: &str = "\u{1f44d}";

const MAX_REACTION_CHARS: usize = 10;

/// Trims a requested reaction, falling back to [`DEFAULT_REACTION`].
pub fn normalize_reaction(reaction: Option<String>) -> Result<String> {
    let reaction = match reaction {
        Some(r) if !r.trim().is_empty() => r.trim().to_string(),
        _ => return Ok(DEFAULT_REACTION.to_string()),
    };
    if reaction.chars().count() > MAX_REACTION_CHARS {
        return Err(ChatError::InvalidMessage(format!(
            "reactions are at most {MAX_REACTION_CHARS} characters"
        )));
    }
    Ok(reaction)
}

/// Outcome of toggling one user's reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionToggle {
    /// `false` when the toggle took an existing reaction away.
    pub added: bool,
    /// Count of each reaction across all users.
    pub reactions: BTreeMap<String, u64>,
}
