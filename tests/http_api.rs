mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use futures_util::future::join_all;
use room_chat::call::{CallId, NewCall, VoiceCall};
use room_chat::chat::{MediaKind, Message, MessageId, NewMessage, ReactionToggle};
use room_chat::moderation::{Classification, Classifier, ModerationError, ModerationVerdict};
use room_chat::room::{NewRoom, Room, RoomId};
use room_chat::store::{MemoryStore, Store};
use room_chat::{ChatError, Result as ChatResult};
use serde_json::json;
use warp::http::StatusCode;

struct RejectEverything;

#[async_trait]
impl Classifier for RejectEverything {
    async fn classify(&self, _kind: MediaKind, _reference: &str) -> Result<Classification, ModerationError> {
        Ok(Classification {
            is_safe: false,
            confidence: 0.97,
            categories: BTreeMap::from([("violence".to_string(), 0.97)]),
        })
    }
}

/// Memory store whose read-state updates always fail.
#[derive(Default)]
struct ReadStateDown {
    inner: MemoryStore,
}

#[async_trait]
impl Store for ReadStateDown {
    async fn create_room(&self, room: NewRoom) -> ChatResult<Room> {
        self.inner.create_room(room).await
    }

    async fn room(&self, id: RoomId) -> ChatResult<Room> {
        self.inner.room(id).await
    }

    async fn find_direct_room(&self, a: &str, b: &str) -> ChatResult<Option<Room>> {
        self.inner.find_direct_room(a, b).await
    }

    async fn open_direct_room(&self, a: &str, b: &str) -> ChatResult<Room> {
        self.inner.open_direct_room(a, b).await
    }

    async fn create_message(&self, message: NewMessage) -> ChatResult<Message> {
        self.inner.create_message(message).await
    }

    async fn message(&self, id: MessageId) -> ChatResult<Message> {
        self.inner.message(id).await
    }

    async fn list_messages(&self, room_id: RoomId, since: Option<MessageId>, limit: usize) -> ChatResult<Vec<Message>> {
        self.inner.list_messages(room_id, since, limit).await
    }

    async fn mark_read(&self, _room_id: RoomId, _viewer: &str) -> ChatResult<u64> {
        Err(ChatError::Storage("read state unavailable".into()))
    }

    async fn record_verdict(&self, message_id: MessageId, kind: MediaKind, verdict: &ModerationVerdict) -> ChatResult<()> {
        self.inner.record_verdict(message_id, kind, verdict).await
    }

    async fn toggle_reaction(&self, message_id: MessageId, user: &str, reaction: &str) -> ChatResult<ReactionToggle> {
        self.inner.toggle_reaction(message_id, user, reaction).await
    }

    async fn create_call(&self, call: NewCall) -> ChatResult<VoiceCall> {
        self.inner.create_call(call).await
    }

    async fn call(&self, id: CallId) -> ChatResult<VoiceCall> {
        self.inner.call(id).await
    }

    async fn save_call(&self, call: &VoiceCall) -> ChatResult<()> {
        self.inner.save_call(call).await
    }

    async fn active_call(&self, room_id: RoomId) -> ChatResult<Option<VoiceCall>> {
        self.inner.active_call(room_id).await
    }
}

#[tokio::test]
async fn direct_rooms_are_reused() {
    let app = app();
    let (status, first) = post(&app, "/rooms/direct", Some("alice"), Some(json!({"with": "bob"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["kind"], "direct");

    let (_, second) = post(&app, "/rooms/direct", Some("bob"), Some(json!({"with": "alice"}))).await;
    assert_eq!(first["id"], second["id"]);

    let (status, _) = post(&app, "/rooms/direct", Some("alice"), Some(json!({"with": "alice"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn group_rooms_include_their_creator() {
    let app = app();
    let (status, room) = post(
        &app,
        "/rooms/group",
        Some("alice"),
        Some(json!({"name": "team", "members": ["bob", "carol"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(room["members"], json!(["alice", "bob", "carol"]));

    let path = format!("/rooms/{}", room["id"]);
    assert_eq!(get(&app, &path, Some("carol")).await.0, StatusCode::OK);
    assert_eq!(get(&app, &path, Some("mallory")).await.0, StatusCode::FORBIDDEN);
    assert_eq!(get(&app, &path, None).await.0, StatusCode::FORBIDDEN);
    assert_eq!(get(&app, "/rooms/999", Some("alice")).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sent_messages_are_broadcast_and_pollable() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut bob = connect(&app, room.id, Some("bob")).await;

    let (status, stored) = post(
        &app,
        &format!("/rooms/{}/messages", room.id),
        Some("alice"),
        Some(json!({"content": "over http"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let frame = next_event(&mut bob).await;
    assert_eq!(frame["message"], "over http");
    assert_eq!(frame["message_id"], stored["id"]);
    assert_eq!(frame["delivery_id"], stored["delivery_id"]);

    let body = poll_until(&app, room.id, "bob", 1).await;
    assert_eq!(body["messages"][0]["id"], stored["id"]);

    let (_, later) = get(
        &app,
        &format!("/rooms/{}/poll?since_id={}", room.id, body["new_since_id"]),
        Some("bob"),
    )
    .await;
    assert!(later["messages"].as_array().unwrap().is_empty());
    assert_eq!(later["new_since_id"], body["new_since_id"]);
}

#[tokio::test]
async fn sending_requires_membership_and_content() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let path = format!("/rooms/{}/messages", room.id);

    let (status, body) = post(&app, &path, Some("mallory"), Some(json!({"content": "hi"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], "error");

    let (status, _) = post(&app, &path, None, Some(json!({"content": "hi"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = post(&app, &path, Some("alice"), Some(json!({"content": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(&app, "/rooms/999/messages", Some("alice"), Some(json!({"content": "hi"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn polling_is_members_only() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let path = format!("/rooms/{}/poll?since_id=0", room.id);
    assert_eq!(get(&app, &path, Some("mallory")).await.0, StatusCode::FORBIDDEN);
    assert_eq!(get(&app, &path, None).await.0, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn mark_read_counts_only_other_peoples_messages() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let send = format!("/rooms/{}/messages", room.id);
    post(&app, &send, Some("alice"), Some(json!({"content": "one"}))).await;
    post(&app, &send, Some("bob"), Some(json!({"content": "two"}))).await;

    let read = format!("/rooms/{}/read", room.id);
    let (_, bob_view) = post(&app, &read, Some("bob"), None).await;
    assert_eq!(bob_view["marked"], 0, "sending already marked alice's message read");

    let (status, body) = post(&app, &read, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["marked"], 1);
    assert_eq!(post(&app, &read, Some("alice"), None).await.1["marked"], 0);
}

#[tokio::test]
async fn rejected_media_is_hidden_from_everyone_but_the_sender() {
    let app = app_with(quiet_config(), Some(Arc::new(RejectEverything)));
    let room = direct_room(&app, "alice", "bob").await;

    let (status, stored) = post(
        &app,
        &format!("/rooms/{}/messages", room.id),
        Some("alice"),
        Some(json!({"content": "look", "image": "uploads/cat.png"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["media"][0]["verdict"]["status"], "pending");

    let own = poll_until(&app, room.id, "alice", 1).await;
    for _ in 0..100 {
        let (_, body) = get(&app, &format!("/rooms/{}/poll?since_id=0", room.id), Some("alice")).await;
        if body["messages"][0]["media"][0]["verdict"]["status"] == "rejected" {
            let (_, theirs) = get(&app, &format!("/rooms/{}/poll?since_id=0", room.id), Some("bob")).await;
            assert!(theirs["messages"].as_array().unwrap().is_empty());
            assert_eq!(theirs["new_since_id"], own["new_since_id"]);
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("media was never moderated");
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let app = app();
    let (status, _) = get(&app, "/nowhere", Some("alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = post(&app, "/calls/1/dance", Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn concurrent_direct_room_requests_share_one_room() {
    let app = app();
    let requests = (0..10).map(|i| {
        let (caller, other) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
        post(&app, "/rooms/direct", Some(caller), Some(json!({"with": other})))
    });
    let mut ids: Vec<_> = join_all(requests).await.into_iter().map(|(_, room)| room["id"].clone()).collect();
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn failed_read_marking_does_not_fail_the_send() {
    let app = app_on(Arc::new(ReadStateDown::default()), quiet_config(), None);
    let room = direct_room(&app, "alice", "bob").await;

    let (status, stored) = post(
        &app,
        &format!("/rooms/{}/messages", room.id),
        Some("alice"),
        Some(json!({"content": "sent once"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["content"], "sent once");

    let body = poll_until(&app, room.id, "bob", 1).await;
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);

    let (status, _) = post(&app, &format!("/rooms/{}/read", room.id), Some("bob"), None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn media_only_messages_name_their_media_live() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut bob = connect(&app, room.id, Some("bob")).await;

    let (status, stored) = post(
        &app,
        &format!("/rooms/{}/messages", room.id),
        Some("alice"),
        Some(json!({"file": "uploads/notes.pdf"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let frame = next_event(&mut bob).await;
    assert_eq!(frame["message_id"], stored["id"]);
    assert_eq!(frame["media"], json!(["file"]));
}

#[tokio::test]
async fn reactions_toggle_for_members() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let (_, stored) = post(
        &app,
        &format!("/rooms/{}/messages", room.id),
        Some("alice"),
        Some(json!({"content": "react to me"})),
    )
    .await;
    let path = format!("/messages/{}/reactions", stored["id"]);

    let (status, body) = post(&app, &path, Some("bob"), Some(json!({"reaction": "heart"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], true);
    assert_eq!(body["reactions"], json!({"heart": 1}));

    let (_, body) = post(&app, &path, Some("alice"), Some(json!({}))).await;
    assert_eq!(body["reactions"], json!({"heart": 1, "\u{1f44d}": 1}));

    let (_, body) = post(&app, &path, Some("bob"), Some(json!({"reaction": "heart"}))).await;
    assert_eq!(body["added"], false);
    assert_eq!(body["reactions"], json!({"\u{1f44d}": 1}));

    assert_eq!(
        post(&app, &path, Some("mallory"), Some(json!({}))).await.0,
        StatusCode::FORBIDDEN
    );
    assert_eq!(post(&app, &path, None, Some(json!({}))).await.0, StatusCode::FORBIDDEN);
    assert_eq!(
        post(&app, "/messages/999/reactions", Some("bob"), Some(json!({}))).await.0,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        post(&app, &path, Some("bob"), Some(json!({"reaction": "x".repeat(11)}))).await.0,
        StatusCode::BAD_REQUEST
    );
}
