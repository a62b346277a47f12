mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use room_chat::registry::SessionHandle;
use room_chat::room::Identity;
use room_chat::store::SqliteStore;
use serde_json::{json, Value};
use warp::http::StatusCode;

#[tokio::test]
async fn chat_reaches_every_member_and_is_stored() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let mut bob = connect(&app, room.id, Some("bob")).await;

    alice
        .send_text(json!({"type": "chat_message", "message": "hi", "username": "alice"}).to_string())
        .await;

    let seen_by_alice = next_event(&mut alice).await;
    let seen_by_bob = next_event(&mut bob).await;
    for frame in [&seen_by_alice, &seen_by_bob] {
        assert_eq!(frame["message"], "hi");
        assert_eq!(frame["username"], "alice");
        assert!(frame["timestamp"].as_str().unwrap().ends_with('M'));
    }

    let body = poll_until(&app, room.id, "bob", 1).await;
    let stored = &body["messages"][0];
    assert_eq!(stored["content"], "hi");
    assert_eq!(stored["sender"], "alice");
    assert_eq!(stored["delivery_id"], seen_by_bob["delivery_id"]);
    assert_eq!(body["new_since_id"], stored["id"]);
}

#[tokio::test]
async fn frames_without_type_are_chat() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;

    alice.send_text(json!({"message": "untyped"}).to_string()).await;
    assert_eq!(next_event(&mut alice).await["message"], "untyped");
}

#[tokio::test]
async fn connecting_announces_the_newcomer_to_the_room() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let _bob = connect(&app, room.id, Some("bob")).await;

    let notice = next_json(&mut alice).await;
    assert_eq!(notice["username"], "System");
    assert_eq!(notice["message"], "bob joined the chat");
}

#[tokio::test]
async fn anonymous_chat_is_delivered_but_not_stored() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let mut guest = connect(&app, room.id, None).await;

    guest
        .send_text(json!({"message": "hello from nowhere", "username": "guest"}).to_string())
        .await;
    let frame = next_event(&mut alice).await;
    assert_eq!(frame["message"], "hello from nowhere");
    assert_eq!(frame["username"], "guest");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (status, body) = get(&app, &format!("/rooms/{}/poll", room.id), Some("alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["messages"].as_array().unwrap().is_empty());
    expect_silence(&mut guest).await;
}

#[tokio::test]
async fn outsider_chat_is_delivered_but_not_stored() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let mut mallory = connect(&app, room.id, Some("mallory")).await;

    mallory.send_text(json!({"message": "psst"}).to_string()).await;
    assert_eq!(next_event(&mut alice).await["message"], "psst");
    assert_eq!(next_event(&mut mallory).await["message"], "psst");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_, body) = get(&app, &format!("/rooms/{}/poll", room.id), Some("alice")).await;
    assert!(body["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_and_test_frames_are_dropped_without_closing() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;

    alice.send_text("this is not json").await;
    alice.send_text(json!({"type": "teleport", "to": "mars"}).to_string()).await;
    alice.send_text(json!({"type": "test", "message": "ping"}).to_string()).await;
    alice.send_text(json!({"message": "   "}).to_string()).await;
    alice.send_text(json!({"message": "still here"}).to_string()).await;

    assert_eq!(next_event(&mut alice).await["message"], "still here");
}

#[tokio::test]
async fn rooms_do_not_leak_into_each_other() {
    let app = app();
    let first = direct_room(&app, "alice", "bob").await;
    let second = direct_room(&app, "alice", "carol").await;
    let mut bob = connect(&app, first.id, Some("bob")).await;
    let mut carol = connect(&app, second.id, Some("carol")).await;

    bob.send_text(json!({"message": "only for room one"}).to_string()).await;
    assert_eq!(next_event(&mut bob).await["message"], "only for room one");
    expect_silence(&mut carol).await;
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let mut bob = connect(&app, room.id, Some("bob")).await;

    for i in 0..10 {
        alice.send_text(json!({"message": format!("m{i}")}).to_string()).await;
    }
    for i in 0..10 {
        assert_eq!(next_event(&mut bob).await["message"], format!("m{i}"));
    }
    let _ = next_event(&mut alice).await;
}

#[tokio::test]
async fn unknown_room_refuses_the_upgrade() {
    let app = app();
    let result = warp::test::ws()
        .path("/ws/chat/999?user=alice")
        .handshake(app.filter.clone())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn disconnect_removes_the_session() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let bob = connect(&app, room.id, Some("bob")).await;
    assert_eq!(app.server.registry().session_count(room.id).await, 2);

    drop(bob);
    let notice = next_json(&mut alice).await;
    assert_eq!(notice["message"], "bob joined the chat");
    let notice = next_json(&mut alice).await;
    assert_eq!(notice["message"], "bob left the chat");
    assert_eq!(app.server.registry().session_count(room.id).await, 1);
}

#[tokio::test]
async fn signals_are_relayed_to_the_room() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let mut bob = connect(&app, room.id, Some("bob")).await;

    let (status, call) = post(&app, &format!("/rooms/{}/calls", room.id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let notification = next_event(&mut bob).await;
    assert_eq!(notification["type"], "call_notification");
    assert_eq!(notification["call_data"]["id"], call["id"]);

    bob.send_text(
        json!({"type": "webrtc_signal", "call_id": call["id"], "signals": [{"type": "answer", "sdp": "v=0"}]})
            .to_string(),
    )
    .await;
    loop {
        let frame = next_event(&mut alice).await;
        if frame["type"] == "webrtc_signal" {
            assert_eq!(frame["sender"], "bob");
            assert_eq!(frame["signals"][0]["sdp"], "v=0");
            break;
        }
    }
}

#[tokio::test]
async fn refused_signal_gets_an_error_frame() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut mallory = connect(&app, room.id, Some("mallory")).await;

    mallory
        .send_text(json!({"type": "webrtc_signal", "call_id": 12345, "signals": [{"x": 1}]}).to_string())
        .await;
    let frame = next_event(&mut mallory).await;
    assert_eq!(frame["type"], "error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polling_replays_a_burst_in_send_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("chat.db")).unwrap());
    let app = app_on(store, quiet_config(), None);
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let mut bob = connect(&app, room.id, Some("bob")).await;

    for i in 0..30 {
        alice.send_text(json!({"message": format!("m{i}")}).to_string()).await;
    }
    let mut live = Vec::new();
    for _ in 0..30 {
        live.push(next_event(&mut bob).await["delivery_id"].clone());
    }

    let body = poll_until(&app, room.id, "bob", 30).await;
    let messages = body["messages"].as_array().unwrap();
    for (i, (stored, delivered)) in messages.iter().zip(&live).enumerate() {
        assert_eq!(stored["content"], format!("m{i}"));
        assert_eq!(&stored["delivery_id"], delivered);
    }
}

#[tokio::test]
async fn idle_sessions_are_closed() {
    let mut config = quiet_config();
    config.session.idle_timeout_secs = 1;
    let app = app_with(config, None);
    let room = direct_room(&app, "alice", "bob").await;
    let mut bob = connect(&app, room.id, Some("bob")).await;
    let mut alice = connect(&app, room.id, Some("alice")).await;

    let mut bob_left = false;
    for i in 0..12 {
        alice.send_text(json!({"message": format!("still here {i}")}).to_string()).await;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(250);
        while let Ok(Ok(frame)) = tokio::time::timeout_at(deadline, alice.recv()).await {
            let frame: Value = serde_json::from_str(frame.to_str().unwrap()).unwrap();
            bob_left |= frame["message"] == "bob left the chat";
        }
        if bob_left {
            break;
        }
    }
    assert!(bob_left, "idle session was never announced as gone");
    wait_closed(&mut bob, Duration::from_secs(1)).await;
    assert_eq!(app.server.registry().session_count(room.id).await, 1);
}

#[tokio::test]
async fn close_request_ends_the_session() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let mut bob = connect(&app, room.id, Some("bob")).await;

    let handle = app
        .server
        .registry()
        .members_of(room.id)
        .await
        .into_iter()
        .find(|h| h.identity().user() == Some("bob"))
        .unwrap();
    handle.close();

    wait_closed(&mut bob, Duration::from_secs(2)).await;
    loop {
        if next_json(&mut alice).await["message"] == "bob left the chat" {
            break;
        }
    }
    assert_eq!(app.server.registry().session_count(room.id).await, 1);
}

#[tokio::test]
async fn slow_consumer_is_evicted_without_holding_up_the_room() {
    let app = app();
    let room = direct_room(&app, "alice", "bob").await;
    let mut alice = connect(&app, room.id, Some("alice")).await;
    let mut bob = connect(&app, room.id, Some("bob")).await;

    let (slow, _undrained) = SessionHandle::new(Identity::from_name(Some("carol".into())), room.id, 1);
    app.server.registry().join(room.id, slow.clone()).await;

    for i in 0..5 {
        alice.send_text(json!({"message": format!("m{i}")}).to_string()).await;
    }
    for i in 0..5 {
        assert_eq!(next_event(&mut bob).await["message"], format!("m{i}"));
    }
    tokio::time::timeout(Duration::from_secs(1), slow.closed())
        .await
        .expect("slow session was not asked to close");
    assert_eq!(app.server.registry().session_count(room.id).await, 2);
}
