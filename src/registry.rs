//! Which live sessions are listening to which room.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::room::{Identity, RoomId};

pub type SessionId = Uuid;

/// The registry's view of one connection: an outbound queue plus a way to
/// ask the connection to shut itself down.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    identity: Identity,
    room_id: RoomId,
    tx: mpsc::Sender<String>,
    closer: Arc<Notify>,
}

impl SessionHandle {
    /// Creates a handle with an outbound queue of `capacity` frames and
    /// returns the receiving end for the connection's writer.
    pub fn new(identity: Identity, room_id: RoomId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = SessionHandle {
            id: Uuid::new_v4(),
            identity,
            room_id,
            tx,
            closer: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Enqueues a frame without waiting.
    pub fn try_deliver(&self, frame: String) -> Result<(), TrySendError<String>> {
        self.tx.try_send(frame)
    }

    /// Asks the connection to close. A request made before the connection
    /// starts waiting is not lost.
    pub fn close(&self) {
        self.closer.notify_one();
    }

    pub async fn closed(&self) {
        self.closer.notified().await;
    }
}

type Members = RwLock<HashMap<SessionId, SessionHandle>>;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Members>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session to a room. Joining twice is a no-op; returns whether
    /// the session was newly added.
    pub async fn join(&self, room_id: RoomId, session: SessionHandle) -> bool {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room_id).or_default().clone();
        let mut members = members.write().await;
        let id = session.id();
        let added = members.insert(id, session).is_none();
        if added {
            debug!("Session {} joined room {} ({} connected)", id, room_id, members.len());
        }
        added
    }

    /// Removes a session from a room, dropping the room once it is empty.
    /// Leaving a room the session is not in is a no-op.
    pub async fn leave(&self, room_id: RoomId, session_id: SessionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get(&room_id).cloned() else {
            return false;
        };
        let mut members = members.write().await;
        let removed = members.remove(&session_id).is_some();
        if members.is_empty() {
            rooms.remove(&room_id);
        }
        if removed {
            debug!("Session {} left room {} ({} connected)", session_id, room_id, members.len());
        }
        removed
    }

    /// Snapshot of the sessions currently in a room. Later joins and leaves
    /// do not affect a snapshot already taken.
    pub async fn members_of(&self, room_id: RoomId) -> Vec<SessionHandle> {
        let members = {
            let rooms = self.rooms.read().await;
            match rooms.get(&room_id) {
                Some(members) => members.clone(),
                None => return Vec::new(),
            }
        };
        let members = members.read().await;
        members.values().cloned().collect()
    }

    pub async fn session_count(&self, room_id: RoomId) -> usize {
        self.members_of(room_id).await.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
