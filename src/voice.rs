//! Voice call orchestration.
//!
//! Wraps the [`VoiceCall`] state machine with authorization, storage and
//! notification. Every state change is saved, announced to the room with a
//! `call_status_update`, and leaves a system message in the room history.
//! Mutations are serialized so concurrent joins and hang-ups on the same
//! call never interleave.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info};
use tokio::sync::Mutex;

use crate::call::{CallId, NewCall, VoiceCall};
use crate::chat::NewMessage;
use crate::dispatcher::Dispatcher;
use crate::error::{ChatError, Result};
use crate::messages::Event;
use crate::persistence::PersistenceBridge;
use crate::room::{Room, RoomId};
use crate::store::Store;

const STARTED: &str = "Started a voice call";
const JOINED: &str = "Joined the voice call";
const ENDED: &str = "Ended the voice call";
const DECLINED: &str = "Declined voice call";
const LEFT: &str = "Left the voice call";
const MISSED: &str = "Missed voice call";

#[derive(Clone)]
pub struct VoiceCalls {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    bridge: PersistenceBridge,
    ring_timeout: Option<Duration>,
    lock: Arc<Mutex<()>>,
}

impl VoiceCalls {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Dispatcher,
        bridge: PersistenceBridge,
        ring_timeout: Option<Duration>,
    ) -> Self {
        VoiceCalls {
            store,
            dispatcher,
            bridge,
            ring_timeout,
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn member_room(&self, room_id: RoomId, user: &str) -> Result<Room> {
        let room = self.store.room(room_id).await?;
        if !room.is_member(user) {
            return Err(ChatError::NotMember);
        }
        Ok(room)
    }

    async fn member_call(&self, call_id: CallId, user: &str) -> Result<(VoiceCall, Room)> {
        let call = self.store.call(call_id).await?;
        let room = self.member_room(call.room_id, user).await?;
        Ok((call, room))
    }

    /// Starts a call in a room. A room with a call already in progress gets
    /// that call back instead of a second one.
    pub async fn initiate(&self, room_id: RoomId, user: &str) -> Result<VoiceCall> {
        let _guard = self.lock.lock().await;
        self.member_room(room_id, user).await?;
        if let Some(active) = self.store.active_call(room_id).await? {
            debug!("Room {} already has call {} in progress", room_id, active.id);
            return Ok(active);
        }

        let call = self
            .store
            .create_call(NewCall {
                room_id,
                initiator: user.to_string(),
                start_time: Utc::now(),
            })
            .await?;
        info!("{} started call {} in room {}", user, call.id, room_id);
        self.dispatcher.broadcast(&Event::call_notification(&call)).await;
        self.system_message(room_id, user, STARTED).await;
        self.schedule_ring_timeout(call.id);
        Ok(call)
    }

    pub async fn join(&self, call_id: CallId, user: &str) -> Result<VoiceCall> {
        let _guard = self.lock.lock().await;
        let (mut call, _room) = self.member_call(call_id, user).await?;
        let outcome = call.join(user)?;
        if !outcome.newly_joined && !outcome.status_changed {
            return Ok(call);
        }
        self.store.save_call(&call).await?;
        info!("{} joined call {} ({})", user, call_id, call.status.as_str());
        self.dispatcher.broadcast(&Event::call_status(&call)).await;
        if outcome.newly_joined {
            self.system_message(call.room_id, user, JOINED).await;
        }
        Ok(call)
    }

    pub async fn end(&self, call_id: CallId, user: &str) -> Result<VoiceCall> {
        let _guard = self.lock.lock().await;
        let (mut call, _room) = self.member_call(call_id, user).await?;
        call.end(user, Utc::now())?;
        self.store.save_call(&call).await?;
        info!("{} ended call {}", user, call_id);
        self.dispatcher.broadcast(&Event::call_status(&call)).await;
        self.system_message(call.room_id, user, ENDED).await;
        Ok(call)
    }

    pub async fn decline(&self, call_id: CallId, user: &str) -> Result<VoiceCall> {
        let _guard = self.lock.lock().await;
        let (mut call, room) = self.member_call(call_id, user).await?;
        let was_participant = call.participants.contains(user);
        let changed = call.decline(user, &room.members, Utc::now())?;
        self.store.save_call(&call).await?;
        info!("{} declined call {} ({})", user, call_id, call.status.as_str());
        if changed || was_participant {
            self.dispatcher.broadcast(&Event::call_status(&call)).await;
        }
        self.system_message(call.room_id, user, DECLINED).await;
        Ok(call)
    }

    pub async fn leave(&self, call_id: CallId, user: &str) -> Result<VoiceCall> {
        let _guard = self.lock.lock().await;
        let (mut call, _room) = self.member_call(call_id, user).await?;
        call.leave(user, Utc::now())?;
        self.store.save_call(&call).await?;
        info!("{} left call {} ({})", user, call_id, call.status.as_str());
        self.dispatcher.broadcast(&Event::call_status(&call)).await;
        self.system_message(call.room_id, user, LEFT).await;
        Ok(call)
    }

    /// The call in progress in a room, if any.
    pub async fn active(&self, room_id: RoomId, user: &str) -> Result<Option<VoiceCall>> {
        self.member_room(room_id, user).await?;
        self.store.active_call(room_id).await
    }

    pub async fn status(&self, call_id: CallId, user: &str) -> Result<VoiceCall> {
        self.member_call(call_id, user).await.map(|(call, _)| call)
    }

    /// Marks a still-ringing call as missed.
    pub async fn expire(&self, call_id: CallId) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut call = self.store.call(call_id).await?;
        if !call.miss(Utc::now()) {
            return Ok(false);
        }
        self.store.save_call(&call).await?;
        info!("Call {} in room {} was not answered", call_id, call.room_id);
        self.dispatcher.broadcast(&Event::call_status(&call)).await;
        self.system_message(call.room_id, &call.initiator, MISSED).await;
        Ok(true)
    }

    fn schedule_ring_timeout(&self, call_id: CallId) {
        let Some(timeout) = self.ring_timeout else {
            return;
        };
        let calls = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = calls.expire(call_id).await {
                error!("Failed to expire call {}: {}", call_id, e);
            }
        });
    }

    /// Records a call event in the room history and shows it to live sessions.
    /// The call itself has already been saved, so a failure here is only logged.
    async fn system_message(&self, room_id: RoomId, sender: &str, text: &str) {
        match self.bridge.persist(NewMessage::text(room_id, sender, text)).await {
            Ok(stored) => {
                self.dispatcher.broadcast(&Event::stored_chat(&stored)).await;
            }
            Err(e) => error!("Failed to record \"{}\" in room {}: {}", text, room_id, e),
        }
    }
}
