use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::call::{CallId, CallStatus, VoiceCall};
use crate::chat::{MediaKind, Message, MessageId};
use crate::room::RoomId;

/// Frames a client may send over its websocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ChatMessage {
        message: String,
        #[serde(default)]
        username: Option<String>,
    },
    WebrtcSignal {
        #[serde(default)]
        call_id: Option<CallId>,
        #[serde(default)]
        signals: Vec<Value>,
    },
    Test {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        username: Option<String>,
    },
}

impl ClientMessage {
    /// Frames without a `type` are chat messages.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        let mut value: Value = serde_json::from_str(raw)?;
        if let Value::Object(map) = &mut value {
            map.entry("type")
                .or_insert_with(|| Value::String("chat_message".to_string()));
        }
        serde_json::from_value(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallData {
    pub id: CallId,
    pub initiator: String,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusData {
    pub call_id: CallId,
    pub status: CallStatus,
    pub participants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl From<&VoiceCall> for CallData {
    fn from(call: &VoiceCall) -> Self {
        CallData {
            id: call.id,
            initiator: call.initiator.clone(),
            status: call.status,
            start_time: call.start_time,
        }
    }
}

impl From<&VoiceCall> for StatusData {
    fn from(call: &VoiceCall) -> Self {
        StatusData {
            call_id: call.id,
            status: call.status,
            participants: call.participants.iter().cloned().collect(),
            end_time: call.end_time,
            duration: call.duration().map(duration_secs),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
pub fn duration_secs(delta: chrono::TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

/// Frames the server sends to clients. Chat and connection notices are
/// untagged `{message, username, timestamp}` objects; everything else carries
/// a `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Chat {
        message: String,
        username: String,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        delivery_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        /// Kinds of media attached; clients fetch them through polling,
        /// which applies moderation.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        media: Vec<MediaKind>,
    },
    Typed(TypedMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedMessage {
    CallNotification {
        call_data: CallData,
    },
    CallStatusUpdate {
        status_data: StatusData,
    },
    WebrtcSignal {
        call_id: CallId,
        sender: String,
        signals: Vec<Value>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Typed(TypedMessage::Error {
            message: message.into(),
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The unit the dispatcher moves between sessions of one room.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ChatMessage {
        room_id: RoomId,
        username: String,
        message: String,
        timestamp: String,
        delivery_id: Uuid,
        message_id: Option<MessageId>,
        media: Vec<MediaKind>,
    },
    ConnectionNotice {
        room_id: RoomId,
        message: String,
        timestamp: String,
    },
    CallNotification {
        room_id: RoomId,
        call: CallData,
    },
    CallStatusUpdate {
        room_id: RoomId,
        status: StatusData,
    },
    SignalingPayload {
        room_id: RoomId,
        call_id: CallId,
        sender: String,
        signals: Vec<Value>,
    },
}

impl Event {
    /// A chat line seen live, before storage has assigned it an id.
    pub fn chat(room_id: RoomId, username: impl Into<String>, message: impl Into<String>) -> Self {
        Event::ChatMessage {
            room_id,
            username: username.into(),
            message: message.into(),
            timestamp: clock_label(Local::now()),
            delivery_id: Uuid::new_v4(),
            message_id: None,
            media: Vec::new(),
        }
    }

    /// A chat line announced after it was stored.
    pub fn stored_chat(message: &Message) -> Self {
        Event::ChatMessage {
            room_id: message.room_id,
            username: message.sender.clone(),
            message: message.content.clone().unwrap_or_default(),
            timestamp: clock_label(message.created_at.with_timezone(&Local)),
            delivery_id: message.delivery_id.unwrap_or_else(Uuid::new_v4),
            message_id: Some(message.id),
            media: message.media.iter().map(|a| a.kind).collect(),
        }
    }

    pub fn notice(room_id: RoomId, message: impl Into<String>) -> Self {
        Event::ConnectionNotice {
            room_id,
            message: message.into(),
            timestamp: clock_label(Local::now()),
        }
    }

    pub fn call_notification(call: &VoiceCall) -> Self {
        Event::CallNotification {
            room_id: call.room_id,
            call: call.into(),
        }
    }

    pub fn call_status(call: &VoiceCall) -> Self {
        Event::CallStatusUpdate {
            room_id: call.room_id,
            status: call.into(),
        }
    }

    pub fn room_id(&self) -> RoomId {
        match self {
            Event::ChatMessage { room_id, .. }
            | Event::ConnectionNotice { room_id, .. }
            | Event::CallNotification { room_id, .. }
            | Event::CallStatusUpdate { room_id, .. }
            | Event::SignalingPayload { room_id, .. } => *room_id,
        }
    }

    pub fn delivery_id(&self) -> Option<Uuid> {
        match self {
            Event::ChatMessage { delivery_id, .. } => Some(*delivery_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::ChatMessage { .. } => "chat_message",
            Event::ConnectionNotice { .. } => "connection_notice",
            Event::CallNotification { .. } => "call_notification",
            Event::CallStatusUpdate { .. } => "call_status_update",
            Event::SignalingPayload { .. } => "webrtc_signal",
        }
    }

    pub fn to_wire(&self) -> ServerMessage {
        match self {
            Event::ChatMessage {
                username,
                message,
                timestamp,
                delivery_id,
                message_id,
                media,
                ..
            } => ServerMessage::Chat {
                message: message.clone(),
                username: username.clone(),
                timestamp: timestamp.clone(),
                delivery_id: Some(*delivery_id),
                message_id: *message_id,
                media: media.clone(),
            },
            Event::ConnectionNotice { message, timestamp, .. } => ServerMessage::Chat {
                message: message.clone(),
                username: "System".to_string(),
                timestamp: timestamp.clone(),
                delivery_id: None,
                message_id: None,
                media: Vec::new(),
            },
            Event::CallNotification { call, .. } => ServerMessage::Typed(TypedMessage::CallNotification {
                call_data: call.clone(),
            }),
            Event::CallStatusUpdate { status, .. } => ServerMessage::Typed(TypedMessage::CallStatusUpdate {
                status_data: status.clone(),
            }),
            Event::SignalingPayload {
                call_id,
                sender,
                signals,
                ..
            } => ServerMessage::Typed(TypedMessage::WebrtcSignal {
                call_id: *call_id,
                sender: sender.clone(),
                signals: signals.clone(),
            }),
        }
    }
}

/// Wall-clock label shown next to live messages, e.g. `3:07 PM`.
pub fn clock_label(at: DateTime<Local>) -> String {
    at.format("%-I:%M %p").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::chat::{MediaUpload, NewMessage};

    #[test]
    fn missing_type_defaults_to_chat() {
        let msg = ClientMessage::decode(r#"{"message": "hi", "username": "alice"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ChatMessage { ref message, .. } if message == "hi"));
    }

    #[test]
    fn unknown_or_malformed_frames_fail_to_decode() {
        assert!(ClientMessage::decode(r#"{"type": "teleport"}"#).is_err());
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ClientMessage::decode(r#"{"type": "chat_message"}"#).is_err());
        assert!(ClientMessage::decode("[1, 2]").is_err());
    }

    #[test]
    fn signal_frames_keep_payload_opaque() {
        let msg = ClientMessage::decode(
            r#"{"type": "webrtc_signal", "call_id": 7, "signals": [{"sdp": "v=0"}, 3]}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::WebrtcSignal { call_id, signals } => {
                assert_eq!(call_id, Some(7));
                assert_eq!(signals, vec![json!({"sdp": "v=0"}), json!(3)]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chat_events_serialize_untagged() {
        let event = Event::ChatMessage {
            room_id: 42,
            username: "alice".into(),
            message: "hi".into(),
            timestamp: "3:07 PM".into(),
            delivery_id: Uuid::nil(),
            message_id: None,
            media: Vec::new(),
        };
        let wire: Value = serde_json::from_str(&event.to_wire().encode().unwrap()).unwrap();
        assert_eq!(wire["message"], "hi");
        assert_eq!(wire["username"], "alice");
        assert_eq!(wire["timestamp"], "3:07 PM");
        assert!(wire.get("type").is_none());
        assert!(wire.get("message_id").is_none());
        assert!(wire.get("media").is_none());
    }

    #[test]
    fn stored_media_messages_name_their_attachments() {
        let stored = Message {
            id: 9,
            room_id: 1,
            sender: "alice".into(),
            content: None,
            media: NewMessage {
                media: vec![MediaUpload {
                    kind: MediaKind::Image,
                    reference: "uploads/cat.png".into(),
                }],
                ..Default::default()
            }
            .attachments(),
            created_at: Utc::now(),
            is_read: false,
            reply_to: None,
            delivery_id: None,
        };
        let frame = Event::stored_chat(&stored).to_wire().encode().unwrap();
        assert!(!frame.contains("uploads/cat.png"));
        let wire: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(wire["message_id"], 9);
        assert_eq!(wire["message"], "");
        assert_eq!(wire["media"], json!(["image"]));
    }

    #[test]
    fn notices_come_from_system() {
        let wire: Value =
            serde_json::from_str(&Event::notice(1, "alice joined the chat").to_wire().encode().unwrap()).unwrap();
        assert_eq!(wire["username"], "System");
        assert_eq!(wire["message"], "alice joined the chat");
    }

    #[test]
    fn typed_events_carry_their_type() {
        let event = Event::SignalingPayload {
            room_id: 1,
            call_id: 3,
            sender: "bob".into(),
            signals: vec![json!({"candidate": "x"})],
        };
        let wire: Value = serde_json::from_str(&event.to_wire().encode().unwrap()).unwrap();
        assert_eq!(wire["type"], "webrtc_signal");
        assert_eq!(wire["call_id"], 3);
        assert_eq!(event.kind(), "webrtc_signal");
    }

    #[test]
    fn clock_label_uses_twelve_hour_format() {
        let at = Local.with_ymd_and_hms(2024, 1, 1, 15, 7, 0).unwrap();
        assert_eq!(clock_label(at), "3:07 PM");
        let midnight = Local.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        assert_eq!(clock_label(midnight), "12:05 AM");
    }
}
