//! Durable storage collaborator.
//!
//! Rooms, messages, reactions, moderation verdicts and voice calls live
//! behind the [`Store`] trait so the live path never cares which backend is
//! in use.
//! Message ids are handed out in commit order and double as the polling
//! watermark.

mod memory;
mod sqlite;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::call::{CallId, NewCall, VoiceCall};
use crate::chat::{MediaKind, Message, MessageId, NewMessage, ReactionToggle};
use crate::error::Result;
use crate::moderation::ModerationVerdict;
use crate::room::{NewRoom, Room, RoomId};

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_room(&self, room: NewRoom) -> Result<Room>;

    async fn room(&self, id: RoomId) -> Result<Room>;

    async fn find_direct_room(&self, a: &str, b: &str) -> Result<Option<Room>>;

    /// Returns the direct room between `a` and `b`, creating it if needed.
    /// Concurrent callers for the same pair all get the same room.
    async fn open_direct_room(&self, a: &str, b: &str) -> Result<Room>;

    /// Rejects empty messages; a `reply_to` outside the room is dropped.
    async fn create_message(&self, message: NewMessage) -> Result<Message>;

    async fn message(&self, id: MessageId) -> Result<Message>;

    /// Messages with id greater than `since`, oldest first, at most `limit`.
    async fn list_messages(&self, room_id: RoomId, since: Option<MessageId>, limit: usize) -> Result<Vec<Message>>;

    /// Marks every unread message not written by `viewer` as read.
    async fn mark_read(&self, room_id: RoomId, viewer: &str) -> Result<u64>;

    async fn record_verdict(&self, message_id: MessageId, kind: MediaKind, verdict: &ModerationVerdict) -> Result<()>;

    /// Adds `user`'s reaction to a message, or removes it if already there.
    async fn toggle_reaction(&self, message_id: MessageId, user: &str, reaction: &str) -> Result<ReactionToggle>;

    async fn create_call(&self, call: NewCall) -> Result<VoiceCall>;

    async fn call(&self, id: CallId) -> Result<VoiceCall>;

    async fn save_call(&self, call: &VoiceCall) -> Result<()>;

    /// The oldest call in the room that has not reached a terminal state.
    async fn active_call(&self, room_id: RoomId) -> Result<Option<VoiceCall>>;
}
