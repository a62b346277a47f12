//! Hands live messages to durable storage without holding up delivery.
//!
//! Live writes go through one queue drained by a single writer task, so
//! messages are committed (and given ids) in the order they were handed
//! over. Polling therefore replays them in the order they went out live.

use std::sync::Arc;

use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use crate::chat::{MediaKind, Message, MessageId, NewMessage};
use crate::error::Result;
use crate::moderation::{ModerationQueue, ModerationVerdict};
use crate::room::RoomId;
use crate::store::Store;

/// Live messages buffered ahead of the writer before senders wait.
const LIVE_WRITE_CAPACITY: usize = 1024;

struct LiveWrite {
    message: NewMessage,
    done: oneshot::Sender<Option<Message>>,
}

#[derive(Clone)]
struct Sink {
    store: Arc<dyn Store>,
    moderation: Option<ModerationQueue>,
}

impl Sink {
    async fn persist(&self, message: NewMessage) -> Result<Message> {
        let stored = self.store.create_message(message).await?;
        if let Some(queue) = &self.moderation {
            queue.submit(&stored);
        }
        Ok(stored)
    }

    async fn drain(self, mut rx: mpsc::Receiver<LiveWrite>) {
        while let Some(LiveWrite { message, done }) = rx.recv().await {
            let room_id = message.room_id;
            let outcome = match self.persist(message).await {
                Ok(stored) => {
                    debug!("Persisted message {} in room {}", stored.id, room_id);
                    Some(stored)
                }
                Err(e) => {
                    error!("Failed to persist message in room {}: {}", room_id, e);
                    None
                }
            };
            let _ = done.send(outcome);
        }
        debug!("Live writer stopped");
    }
}

#[derive(Clone)]
pub struct PersistenceBridge {
    sink: Sink,
    live: mpsc::Sender<LiveWrite>,
}

impl PersistenceBridge {
    /// Spawns the live writer; must be called inside a Tokio runtime.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::start(Sink { store, moderation: None })
    }

    /// Newly stored media will be queued for moderation.
    pub fn with_moderation(self, queue: ModerationQueue) -> Self {
        Self::start(Sink {
            store: self.sink.store,
            moderation: Some(queue),
        })
    }

    fn start(sink: Sink) -> Self {
        let (live, rx) = mpsc::channel(LIVE_WRITE_CAPACITY);
        tokio::spawn(sink.clone().drain(rx));
        PersistenceBridge { sink, live }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.sink.store
    }

    /// Stores a message and queues its media for moderation.
    pub async fn persist(&self, message: NewMessage) -> Result<Message> {
        self.sink.persist(message).await
    }

    /// Queues a message on the live writer. Waits only while the queue is
    /// full. A failed write is logged and never reaches the sender; the
    /// returned receiver yields the stored message, or `None` on failure.
    pub async fn persist_in_background(&self, message: NewMessage) -> oneshot::Receiver<Option<Message>> {
        let (done, outcome) = oneshot::channel();
        let room_id = message.room_id;
        if self.live.send(LiveWrite { message, done }).await.is_err() {
            error!("Live writer is gone, dropping message for room {}", room_id);
        }
        outcome
    }

    pub async fn mark_read(&self, room_id: RoomId, viewer: &str) -> Result<u64> {
        self.sink.store.mark_read(room_id, viewer).await
    }

    pub async fn record_verdict(&self, message_id: MessageId, kind: MediaKind, verdict: &ModerationVerdict) -> Result<()> {
        self.sink.store.record_verdict(message_id, kind, verdict).await
    }
}
