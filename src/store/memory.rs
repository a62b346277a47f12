use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::Store;
use crate::call::{CallId, NewCall, VoiceCall};
use crate::chat::{MediaKind, Message, MessageId, NewMessage, ReactionToggle};
use crate::error::{ChatError, Result};
use crate::moderation::ModerationVerdict;
use crate::room::{NewRoom, Room, RoomId, RoomKind};

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomId, Room>,
    messages: BTreeMap<MessageId, Message>,
    calls: BTreeMap<CallId, VoiceCall>,
    /// `(user, reaction)` pairs per message.
    reactions: HashMap<MessageId, BTreeSet<(String, String)>>,
    next_room: RoomId,
    next_message: MessageId,
    next_call: CallId,
}

/// Single-process store. Everything sits behind one lock, so ids and
/// timestamps are assigned in the same order.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tables {
    fn insert_room(&mut self, room: NewRoom) -> Room {
        self.next_room += 1;
        let stored = Room {
            id: self.next_room,
            name: room.name,
            kind: room.kind,
            members: room.members,
            created_at: Utc::now(),
        };
        self.rooms.insert(stored.id, stored.clone());
        stored
    }

    fn direct_room(&self, a: &str, b: &str) -> Option<&Room> {
        self.rooms
            .values()
            .filter(|r| r.kind == RoomKind::Direct && r.is_member(a) && r.is_member(b))
            .min_by_key(|r| r.id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_room(&self, room: NewRoom) -> Result<Room> {
        room.validate()?;
        Ok(self.tables.write().await.insert_room(room))
    }

    async fn room(&self, id: RoomId) -> Result<Room> {
        let tables = self.tables.read().await;
        tables.rooms.get(&id).cloned().ok_or(ChatError::RoomNotFound(id))
    }

    async fn find_direct_room(&self, a: &str, b: &str) -> Result<Option<Room>> {
        Ok(self.tables.read().await.direct_room(a, b).cloned())
    }

    async fn open_direct_room(&self, a: &str, b: &str) -> Result<Room> {
        let room = NewRoom::direct(a, b)?;
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.direct_room(a, b) {
            return Ok(existing.clone());
        }
        Ok(tables.insert_room(room))
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        let message = message.normalize()?;
        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(&message.room_id) {
            return Err(ChatError::RoomNotFound(message.room_id));
        }
        let reply_to = message.reply_to.filter(|id| {
            tables
                .messages
                .get(id)
                .is_some_and(|m| m.room_id == message.room_id)
        });
        tables.next_message += 1;
        let stored = Message {
            id: tables.next_message,
            room_id: message.room_id,
            media: message.attachments(),
            sender: message.sender,
            content: message.content,
            created_at: Utc::now(),
            is_read: false,
            reply_to,
            delivery_id: message.delivery_id,
        };
        tables.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn message(&self, id: MessageId) -> Result<Message> {
        let tables = self.tables.read().await;
        tables.messages.get(&id).cloned().ok_or(ChatError::MessageNotFound(id))
    }

    async fn list_messages(&self, room_id: RoomId, since: Option<MessageId>, limit: usize) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let start = since.unwrap_or(0).saturating_add(1);
        Ok(tables
            .messages
            .range(start..)
            .map(|(_, m)| m)
            .filter(|m| m.room_id == room_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, room_id: RoomId, viewer: &str) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut marked = 0;
        for message in tables.messages.values_mut() {
            if message.room_id == room_id && !message.is_read && message.sender != viewer {
                message.is_read = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn record_verdict(&self, message_id: MessageId, kind: MediaKind, verdict: &ModerationVerdict) -> Result<()> {
        let mut tables = self.tables.write().await;
        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| ChatError::Storage(format!("message {message_id} does not exist")))?;
        let attachment = message
            .media
            .iter_mut()
            .find(|a| a.kind == kind)
            .ok_or_else(|| ChatError::Storage(format!("message {message_id} has no {} attachment", kind.as_str())))?;
        attachment.verdict = Some(verdict.clone());
        Ok(())
    }

    async fn toggle_reaction(&self, message_id: MessageId, user: &str, reaction: &str) -> Result<ReactionToggle> {
        let mut tables = self.tables.write().await;
        if !tables.messages.contains_key(&message_id) {
            return Err(ChatError::MessageNotFound(message_id));
        }
        let set = tables.reactions.entry(message_id).or_default();
        let key = (user.to_string(), reaction.to_string());
        let added = if set.remove(&key) {
            false
        } else {
            set.insert(key);
            true
        };
        let mut reactions = BTreeMap::new();
        for (_, r) in set.iter() {
            *reactions.entry(r.clone()).or_insert(0) += 1;
        }
        Ok(ReactionToggle { added, reactions })
    }

    async fn create_call(&self, call: NewCall) -> Result<VoiceCall> {
        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(&call.room_id) {
            return Err(ChatError::RoomNotFound(call.room_id));
        }
        tables.next_call += 1;
        let stored = VoiceCall::new(tables.next_call, call);
        tables.calls.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn call(&self, id: CallId) -> Result<VoiceCall> {
        let tables = self.tables.read().await;
        tables.calls.get(&id).cloned().ok_or(ChatError::CallNotFound(id))
    }

    async fn save_call(&self, call: &VoiceCall) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.calls.get_mut(&call.id) {
            Some(existing) => {
                *existing = call.clone();
                Ok(())
            }
            None => Err(ChatError::CallNotFound(call.id)),
        }
    }

    async fn active_call(&self, room_id: RoomId) -> Result<Option<VoiceCall>> {
        let tables = self.tables.read().await;
        Ok(tables
            .calls
            .values()
            .find(|c| c.room_id == room_id && !c.status.is_terminal())
            .cloned())
    }
}
