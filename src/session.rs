//! One websocket connection bound to one room.
//!
//! Lifecycle: `Connecting -> Open -> Closing -> Closed`. While open, a reader
//! loop decodes client frames and a writer task drains the session's bounded
//! outbound queue onto the socket. The reader stops on a close frame, a
//! transport error, an idle timeout, or a close request from the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use warp::ws::{Message as WsMessage, WebSocket};

use crate::call::CallId;
use crate::chat::NewMessage;
use crate::config::SessionConfig;
use crate::messages::{ClientMessage, Event, ServerMessage};
use crate::registry::SessionHandle;
use crate::room::{Identity, Room};
use crate::server::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub struct Session {
    server: Arc<Server>,
    handle: SessionHandle,
    room: Room,
    state: SessionState,
}

impl Session {
    /// Drives a freshly upgraded socket until it closes.
    pub async fn run(server: Arc<Server>, ws: WebSocket, room: Room, identity: Identity) {
        let config: SessionConfig = server.session_config().clone();
        let (handle, rx) = SessionHandle::new(identity, room.id, config.outbound_capacity);
        let (ws_tx, ws_rx) = ws.split();
        let (stop_tx, stop_rx) = oneshot::channel();
        let writer = tokio::spawn(write_frames(ws_tx, rx, stop_rx, handle.id()));

        let mut session = Session {
            server,
            handle,
            room,
            state: SessionState::Connecting,
        };
        session.open().await;
        session.read_frames(ws_rx, idle_limit(&config)).await;
        session.close(writer, stop_tx, config.close_timeout()).await;
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {}: {:?} -> {:?}", self.handle.id(), self.state, next);
        self.state = next;
    }

    async fn open(&mut self) {
        self.server.registry().join(self.room.id, self.handle.clone()).await;
        self.transition(SessionState::Open);
        info!(
            "{} connected to room {} (session {})",
            self.handle.identity(),
            self.room.id,
            self.handle.id()
        );
        self.server
            .dispatcher()
            .broadcast(&Event::notice(
                self.room.id,
                format!("{} joined the chat", self.handle.identity()),
            ))
            .await;
    }

    async fn read_frames(&self, mut ws_rx: SplitStream<WebSocket>, idle: Duration) {
        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(idle, ws_rx.next()) => next,
                () = self.handle.closed() => {
                    info!("Session {} was asked to close", self.handle.id());
                    break;
                }
            };
            match next {
                Err(_) => {
                    info!("Session {} idle for {:?}, closing", self.handle.id(), idle);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!("WebSocket error on session {}: {}", self.handle.id(), e);
                    break;
                }
                Ok(Some(Ok(frame))) => {
                    if frame.is_close() {
                        break;
                    }
                    if let Ok(text) = frame.to_str() {
                        self.receive(text).await;
                    }
                }
            }
        }
    }

    async fn receive(&self, text: &str) {
        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame on session {}: {}", self.handle.id(), e);
                return;
            }
        };
        match message {
            ClientMessage::ChatMessage { message, username } => self.chat(message, username).await,
            ClientMessage::WebrtcSignal { call_id, signals } => self.signal(call_id, signals).await,
            ClientMessage::Test { message, username } => {
                info!(
                    "Test frame from {}: {}",
                    username.as_deref().unwrap_or("unknown"),
                    message.as_deref().unwrap_or_default()
                );
            }
        }
    }

    /// Live delivery first; members' messages are then queued on the live
    /// writer, tagged with the same delivery id.
    async fn chat(&self, text: String, username: Option<String>) {
        if text.trim().is_empty() {
            debug!("Ignoring empty chat frame on session {}", self.handle.id());
            return;
        }
        let identity = self.handle.identity();
        let display = match identity.user() {
            Some(user) => user.to_string(),
            None => username
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| identity.to_string()),
        };

        let event = Event::chat(self.room.id, display, text.clone());
        let delivery_id = event.delivery_id();
        self.server.dispatcher().broadcast(&event).await;

        match identity.user() {
            Some(user) if self.room.is_member(user) => {
                let _ = self
                    .server
                    .bridge()
                    .persist_in_background(NewMessage {
                        room_id: self.room.id,
                        sender: user.to_string(),
                        content: Some(text),
                        delivery_id,
                        ..Default::default()
                    })
                    .await;
            }
            _ => debug!(
                "Not storing message from {} in room {}: not a member",
                identity, self.room.id
            ),
        }
    }

    async fn signal(&self, call_id: Option<CallId>, signals: Vec<Value>) {
        let Some(call_id) = call_id else {
            debug!("Dropping signal without call id on session {}", self.handle.id());
            return;
        };
        if signals.is_empty() {
            debug!("Dropping empty signal for call {}", call_id);
            return;
        }
        let result = self
            .server
            .signaling()
            .relay(self.room.id, call_id, self.handle.identity(), signals)
            .await;
        match result {
            Ok(_) => {}
            Err(e) if e.is_rejection() => {
                warn!("Refused signal for call {} from {}: {}", call_id, self.handle.identity(), e);
                self.reply(&ServerMessage::error(e.to_string()));
            }
            Err(e) => error!("Failed to relay signal for call {}: {}", call_id, e),
        }
    }

    /// Sends a frame to this session only.
    fn reply(&self, message: &ServerMessage) {
        match message.encode() {
            Ok(frame) => {
                if let Err(e) = self.handle.try_deliver(frame) {
                    debug!("Could not reply to session {}: {}", self.handle.id(), e);
                }
            }
            Err(e) => error!("Failed to encode reply: {}", e),
        }
    }

    async fn close(mut self, mut writer: JoinHandle<()>, stop: oneshot::Sender<()>, grace: Duration) {
        self.transition(SessionState::Closing);
        let room_id = self.room.id;
        self.server.registry().leave(room_id, self.handle.id()).await;
        let _ = stop.send(());

        if tokio::time::timeout(grace, &mut writer).await.is_err() {
            warn!("Session {} writer did not finish in {:?}, aborting", self.handle.id(), grace);
            writer.abort();
        }
        self.transition(SessionState::Closed);
        info!("{} disconnected from room {}", self.handle.identity(), room_id);

        self.server
            .dispatcher()
            .broadcast(&Event::notice(
                room_id,
                format!("{} left the chat", self.handle.identity()),
            ))
            .await;
    }
}

fn idle_limit(config: &SessionConfig) -> Duration {
    if config.idle_timeout_secs == 0 {
        Duration::MAX
    } else {
        config.idle_timeout()
    }
}

/// Drains the outbound queue onto the socket. Once stopped, whatever is
/// already queued is flushed before the close frame goes out.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
    mut stop: oneshot::Receiver<()>,
    session_id: uuid::Uuid,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws_tx.send(WsMessage::text(frame)).await {
                        debug!("Session {} socket write failed: {}", session_id, e);
                        return;
                    }
                }
                None => break,
            },
            _ = &mut stop => {
                while let Ok(frame) = rx.try_recv() {
                    if ws_tx.send(WsMessage::text(frame)).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    if let Err(e) = ws_tx.close().await {
        debug!("Session {} close frame not sent: {}", session_id, e);
    }
}
