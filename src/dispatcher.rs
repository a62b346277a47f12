//! Fan-out of room events to every live session in the room.
//!
//! The event is encoded once and pushed onto each recipient's bounded
//! outbound queue without awaiting. Two broadcasts made one after the other
//! from the same task therefore land in every queue in that order. A
//! recipient whose queue is full or gone is evicted and asked to close; it
//! never slows down the others.

use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::mpsc::error::TrySendError;

use crate::messages::Event;
use crate::registry::RoomRegistry;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RoomRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Dispatcher { registry }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Delivers `event` to the sessions registered in its room at the moment
    /// of the call. Returns how many sessions it was queued for.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let room_id = event.room_id();
        let frame = match event.to_wire().encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {} for room {}: {}", event.kind(), room_id, e);
                return 0;
            }
        };

        let recipients = self.registry.members_of(room_id).await;
        let mut delivered = 0;
        let mut evicted = Vec::new();
        for session in &recipients {
            match session.try_deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Session {} ({}) in room {} is not keeping up, disconnecting it",
                        session.id(),
                        session.identity(),
                        room_id
                    );
                    evicted.push(session);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Session {} in room {} already gone", session.id(), room_id);
                    evicted.push(session);
                }
            }
        }

        for session in evicted {
            self.registry.leave(room_id, session.id()).await;
            session.close();
        }
        debug!(
            "Broadcast {} to {}/{} sessions in room {}",
            event.kind(),
            delivered,
            recipients.len(),
            room_id
        );
        delivered
    }
}
