//! Incremental fetch for clients that cannot hold a websocket open.
//!
//! A client keeps the highest id it has seen (`since_id`) and asks for
//! anything newer. Ids are handed out in commit order, so a message that
//! existed before a poll began is either returned by it or by a later one.
//! Messages hidden from the viewer still advance the watermark.

use std::sync::Arc;

use serde::Serialize;

use crate::chat::{Message, MessageId};
use crate::error::{ChatError, Result};
use crate::room::RoomId;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct PollResponse {
    pub messages: Vec<Message>,
    pub new_since_id: MessageId,
}

#[derive(Clone)]
pub struct FallbackPoller {
    store: Arc<dyn Store>,
    batch_limit: usize,
    pending_visible: bool,
}

impl FallbackPoller {
    pub fn new(store: Arc<dyn Store>, batch_limit: usize, pending_visible: bool) -> Self {
        FallbackPoller {
            store,
            batch_limit: batch_limit.max(1),
            pending_visible,
        }
    }

    /// Messages in `room_id` newer than `since_id` that `viewer` may see,
    /// oldest first. A full batch means the caller should poll again at once.
    pub async fn poll(&self, room_id: RoomId, viewer: &str, since_id: MessageId) -> Result<PollResponse> {
        let room = self.store.room(room_id).await?;
        if !room.is_member(viewer) {
            return Err(ChatError::NotMember);
        }

        let batch = self
            .store
            .list_messages(room_id, Some(since_id), self.batch_limit)
            .await?;
        let new_since_id = batch.last().map_or(since_id, |m| m.id.max(since_id));
        let messages = batch
            .into_iter()
            .filter(|m| m.visible_to(viewer, self.pending_visible))
            .collect();
        Ok(PollResponse { messages, new_since_id })
    }
}
