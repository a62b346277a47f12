#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use room_chat::config::Config;
use room_chat::moderation::Classifier;
use room_chat::room::{NewRoom, Room};
use room_chat::store::{MemoryStore, Store};
use room_chat::{routes, Server};
use serde_json::Value;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::test::WsClient;

pub struct TestApp {
    pub server: Arc<Server>,
    pub filter: BoxedFilter<(Response,)>,
}

pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.calls.ring_timeout_secs = 0;
    config
}

pub fn app() -> TestApp {
    app_with(quiet_config(), None)
}

pub fn app_with(config: Config, classifier: Option<Arc<dyn Classifier>>) -> TestApp {
    app_on(Arc::new(MemoryStore::new()), config, classifier)
}

pub fn app_on(store: Arc<dyn Store>, config: Config, classifier: Option<Arc<dyn Classifier>>) -> TestApp {
    let server = Arc::new(Server::new(store, &config, classifier));
    TestApp {
        filter: routes(server.clone()),
        server,
    }
}

pub async fn direct_room(app: &TestApp, a: &str, b: &str) -> Room {
    app.server
        .store()
        .create_room(NewRoom::direct(a, b).unwrap())
        .await
        .unwrap()
}

/// Opens a websocket and waits until the session has announced itself, so
/// it is registered before the test goes on.
pub async fn connect(app: &TestApp, room_id: i64, user: Option<&str>) -> WsClient {
    let path = match user {
        Some(user) => format!("/ws/chat/{room_id}?user={user}"),
        None => format!("/ws/chat/{room_id}"),
    };
    let mut client = warp::test::ws()
        .path(&path)
        .handshake(app.filter.clone())
        .await
        .expect("handshake");
    let announced = format!("{} joined the chat", user.unwrap_or("Anonymous"));
    loop {
        let frame = next_json(&mut client).await;
        if frame["username"] == "System" && frame["message"] == announced.as_str() {
            return client;
        }
    }
}

pub async fn next_json(client: &mut WsClient) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("websocket closed");
    serde_json::from_str(frame.to_str().expect("text frame")).expect("json frame")
}

/// Next frame that is not a connection notice.
pub async fn next_event(client: &mut WsClient) -> Value {
    loop {
        let frame = next_json(client).await;
        if frame["username"] != "System" {
            return frame;
        }
    }
}

pub async fn expect_silence(client: &mut WsClient) {
    loop {
        match tokio::time::timeout(Duration::from_millis(150), client.recv()).await {
            Err(_) => return,
            Ok(Ok(frame)) => {
                let value: Value = serde_json::from_str(frame.to_str().unwrap()).unwrap();
                assert_eq!(value["username"], "System", "unexpected frame {value}");
            }
            Ok(Err(e)) => panic!("websocket failed: {e}"),
        }
    }
}

/// Waits for the server to close the socket, skipping frames sent before.
pub async fn wait_closed(client: &mut WsClient, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, client.recv()).await {
            Err(_) => panic!("socket still open after {within:?}"),
            Ok(Err(_)) => return,
            Ok(Ok(_)) => {}
        }
    }
}

pub async fn get(app: &TestApp, path: &str, user: Option<&str>) -> (StatusCode, Value) {
    let mut request = warp::test::request().method("GET").path(path);
    if let Some(user) = user {
        request = request.header("x-user", user);
    }
    decode(request.reply(&app.filter).await)
}

pub async fn post(app: &TestApp, path: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = warp::test::request().method("POST").path(path);
    if let Some(user) = user {
        request = request.header("x-user", user);
    }
    if let Some(body) = body {
        request = request.json(&body);
    }
    decode(request.reply(&app.filter).await)
}

fn decode(response: warp::http::Response<warp::hyper::body::Bytes>) -> (StatusCode, Value) {
    let status = response.status();
    let body = if response.body().is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(response.body()).unwrap_or(Value::Null)
    };
    (status, body)
}

/// Polls until at least `count` messages are visible to `user`.
pub async fn poll_until(app: &TestApp, room_id: i64, user: &str, count: usize) -> Value {
    for _ in 0..300 {
        let (status, body) = get(app, &format!("/rooms/{room_id}/poll?since_id=0"), Some(user)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        if body["messages"].as_array().map_or(0, Vec::len) >= count {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {room_id} never showed {count} message(s) to {user}");
}
