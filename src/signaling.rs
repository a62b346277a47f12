use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::call::CallId;
use crate::dispatcher::Dispatcher;
use crate::error::{ChatError, Result};
use crate::messages::Event;
use crate::room::{Identity, RoomId};
use crate::store::Store;

/// Forwards opaque WebRTC negotiation payloads between members of a call's
/// room. Payloads are never inspected.
#[derive(Clone)]
pub struct SignalingRelay {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
}

impl SignalingRelay {
    pub fn new(store: Arc<dyn Store>, dispatcher: Dispatcher) -> Self {
        SignalingRelay { store, dispatcher }
    }

    /// Broadcasts `signals` to the room if the call belongs to it and the
    /// sender is a member. Returns how many sessions received it.
    pub async fn relay(&self, room_id: RoomId, call_id: CallId, sender: &Identity, signals: Vec<Value>) -> Result<usize> {
        let user = sender.require_user()?;
        let call = self.store.call(call_id).await?;
        if call.room_id != room_id {
            return Err(ChatError::CallNotFound(call_id));
        }
        let room = self.store.room(room_id).await?;
        if !room.is_member(user) {
            return Err(ChatError::NotMember);
        }

        let count = signals.len();
        let delivered = self
            .dispatcher
            .broadcast(&Event::SignalingPayload {
                room_id,
                call_id,
                sender: user.to_string(),
                signals,
            })
            .await;
        debug!("Relayed {} signal(s) for call {} from {}", count, call_id, user);
        Ok(delivered)
    }
}
