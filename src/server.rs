use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::ws::{WebSocket, Ws};
use warp::{Filter, Reply};

use crate::call::{CallId, VoiceCall};
use crate::chat::{normalize_reaction, MediaKind, MediaUpload, MessageId, NewMessage};
use crate::config::{Config, SessionConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{ChatError, Result};
use crate::messages::{duration_secs, Event};
use crate::moderation::{Classifier, ModerationQueue};
use crate::persistence::PersistenceBridge;
use crate::poller::FallbackPoller;
use crate::registry::RoomRegistry;
use crate::room::{Identity, NewRoom, Room, RoomId};
use crate::session::Session;
use crate::signaling::SignalingRelay;
use crate::store::Store;
use crate::voice::VoiceCalls;

const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Everything a connection or request handler needs, wired together once at
/// startup.
pub struct Server {
    store: Arc<dyn Store>,
    registry: Arc<RoomRegistry>,
    dispatcher: Dispatcher,
    bridge: PersistenceBridge,
    signaling: SignalingRelay,
    poller: FallbackPoller,
    calls: VoiceCalls,
    session: SessionConfig,
}

impl Server {
    /// Must be called from within a tokio runtime: the live writer and the
    /// moderation worker are spawned here.
    pub fn new(store: Arc<dyn Store>, config: &Config, classifier: Option<Arc<dyn Classifier>>) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());

        let mut bridge = PersistenceBridge::new(store.clone());
        if let Some(classifier) = classifier.filter(|_| config.moderation.enabled) {
            let queue = ModerationQueue::start(classifier, bridge.clone(), &config.moderation);
            bridge = bridge.with_moderation(queue);
        }

        let ring_timeout = match config.calls.ring_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Server {
            signaling: SignalingRelay::new(store.clone(), dispatcher.clone()),
            poller: FallbackPoller::new(
                store.clone(),
                config.poll.batch_limit,
                config.moderation.pending_visible,
            ),
            calls: VoiceCalls::new(store.clone(), dispatcher.clone(), bridge.clone(), ring_timeout),
            session: config.session.clone(),
            store,
            registry,
            dispatcher,
            bridge,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn bridge(&self) -> &PersistenceBridge {
        &self.bridge
    }

    pub fn signaling(&self) -> &SignalingRelay {
        &self.signaling
    }

    pub fn poller(&self) -> &FallbackPoller {
        &self.poller
    }

    pub fn calls(&self) -> &VoiceCalls {
        &self.calls
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    pub async fn handle_connection(self: Arc<Self>, ws: WebSocket, room: Room, identity: Identity) {
        Session::run(self, ws, room, identity).await;
    }

    async fn member_room(&self, room_id: RoomId, identity: &Identity) -> Result<(Room, String)> {
        let user = identity.require_user()?;
        let room = self.store.room(room_id).await?;
        if !room.is_member(user) {
            return Err(ChatError::NotMember);
        }
        Ok((room, user.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(default)]
    since_id: MessageId,
}

#[derive(Debug, Deserialize)]
struct DirectRoomRequest {
    with: String,
}

#[derive(Debug, Deserialize)]
struct GroupRoomRequest {
    name: String,
    #[serde(default)]
    members: Vec<String>,
}

/// Media fields carry storage references of already uploaded files.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SendMessageRequest {
    content: Option<String>,
    image: Option<String>,
    video: Option<String>,
    file: Option<String>,
    voice: Option<String>,
    reply_to: Option<MessageId>,
}

impl SendMessageRequest {
    fn into_new_message(self, room_id: RoomId, sender: String) -> NewMessage {
        let media = [
            (MediaKind::Image, self.image),
            (MediaKind::Video, self.video),
            (MediaKind::File, self.file),
            (MediaKind::Voice, self.voice),
        ]
        .into_iter()
        .filter_map(|(kind, reference)| reference.map(|reference| MediaUpload { kind, reference }))
        .collect();
        NewMessage {
            room_id,
            sender,
            content: self.content,
            media,
            reply_to: self.reply_to,
            delivery_id: Some(Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReactionRequest {
    reaction: Option<String>,
}

#[derive(Debug, Serialize)]
struct MarkedRead {
    marked: u64,
}

#[derive(Debug, Serialize)]
struct ActiveCall {
    call: Option<CallView>,
}

#[derive(Debug, Serialize)]
struct CallView {
    #[serde(flatten)]
    call: VoiceCall,
    duration: Option<f64>,
}

impl From<VoiceCall> for CallView {
    fn from(call: VoiceCall) -> Self {
        CallView {
            duration: call.duration().map(duration_secs),
            call,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

#[derive(Debug, Clone, Copy)]
enum CallAction {
    Join,
    End,
    Decline,
    Leave,
}

impl CallAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "join" => Some(CallAction::Join),
            "end" => Some(CallAction::End),
            "decline" => Some(CallAction::Decline),
            "leave" => Some(CallAction::Leave),
            _ => None,
        }
    }
}

fn error_reply(err: &ChatError) -> Response {
    let status = err.status_code();
    let message = if status.is_server_error() {
        error!("Request failed: {}", err);
        "Internal server error".to_string()
    } else {
        debug!("Request refused: {}", err);
        err.to_string()
    };
    warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            status: "error",
            message,
        }),
        status,
    )
    .into_response()
}

fn reply<T: Serialize>(result: Result<T>) -> std::result::Result<Response, Infallible> {
    Ok(match result {
        Ok(body) => warp::reply::json(&body).into_response(),
        Err(e) => error_reply(&e),
    })
}

fn with_server(server: Arc<Server>) -> impl Filter<Extract = (Arc<Server>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// HTTP callers identify themselves with the `x-user` header.
fn identity() -> impl Filter<Extract = (Identity,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("x-user").map(Identity::from_name)
}

fn json_body<T: serde::de::DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

async fn upgrade(room_id: RoomId, ws: Ws, query: WsQuery, server: Arc<Server>) -> std::result::Result<Response, Infallible> {
    let identity = Identity::from_name(query.user);
    match server.store.room(room_id).await {
        Ok(room) => Ok(ws
            .on_upgrade(move |socket| server.handle_connection(socket, room, identity))
            .into_response()),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn create_direct_room(
    identity: Identity,
    body: DirectRoomRequest,
    server: Arc<Server>,
) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let user = identity.require_user()?;
            server.store.open_direct_room(user, &body.with).await
        }
        .await,
    )
}

async fn create_group_room(
    identity: Identity,
    body: GroupRoomRequest,
    server: Arc<Server>,
) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let user = identity.require_user()?;
            let room = NewRoom::group(body.name, user, body.members)?;
            server.store.create_room(room).await
        }
        .await,
    )
}

async fn get_room(room_id: RoomId, identity: Identity, server: Arc<Server>) -> std::result::Result<Response, Infallible> {
    reply(server.member_room(room_id, &identity).await.map(|(room, _)| room))
}

/// Stores first, then announces to the room with the stored id attached.
/// Sending also counts as having read the room; failing to record that does
/// not fail the send.
async fn send_message(
    room_id: RoomId,
    identity: Identity,
    body: SendMessageRequest,
    server: Arc<Server>,
) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let (_room, user) = server.member_room(room_id, &identity).await?;
            let stored = server.bridge.persist(body.into_new_message(room_id, user.clone())).await?;
            server.dispatcher.broadcast(&Event::stored_chat(&stored)).await;
            if let Err(e) = server.bridge.mark_read(room_id, &user).await {
                warn!("Failed to mark room {} read for {}: {}", room_id, user, e);
            }
            Ok::<_, ChatError>(stored)
        }
        .await,
    )
}

/// Toggles the caller's reaction on a message in one of their rooms.
async fn react(
    message_id: MessageId,
    identity: Identity,
    body: ReactionRequest,
    server: Arc<Server>,
) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let message = server.store.message(message_id).await?;
            let (_room, user) = server.member_room(message.room_id, &identity).await?;
            let reaction = normalize_reaction(body.reaction)?;
            server.store.toggle_reaction(message_id, &user, &reaction).await
        }
        .await,
    )
}

async fn poll_messages(
    room_id: RoomId,
    identity: Identity,
    query: PollQuery,
    server: Arc<Server>,
) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let user = identity.require_user()?;
            server.poller.poll(room_id, user, query.since_id).await
        }
        .await,
    )
}

async fn mark_read(room_id: RoomId, identity: Identity, server: Arc<Server>) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let (_room, user) = server.member_room(room_id, &identity).await?;
            let marked = server.bridge.mark_read(room_id, &user).await?;
            Ok::<_, ChatError>(MarkedRead { marked })
        }
        .await,
    )
}

async fn initiate_call(room_id: RoomId, identity: Identity, server: Arc<Server>) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let user = identity.require_user()?;
            server.calls.initiate(room_id, user).await.map(CallView::from)
        }
        .await,
    )
}

async fn active_call(room_id: RoomId, identity: Identity, server: Arc<Server>) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let user = identity.require_user()?;
            let call = server.calls.active(room_id, user).await?;
            Ok::<_, ChatError>(ActiveCall {
                call: call.map(CallView::from),
            })
        }
        .await,
    )
}

async fn call_action(
    call_id: CallId,
    action: String,
    identity: Identity,
    server: Arc<Server>,
) -> std::result::Result<Response, warp::Rejection> {
    let Some(action) = CallAction::parse(&action) else {
        return Err(warp::reject::not_found());
    };
    let result = async {
        let user = identity.require_user()?;
        let call = match action {
            CallAction::Join => server.calls.join(call_id, user).await?,
            CallAction::End => server.calls.end(call_id, user).await?,
            CallAction::Decline => server.calls.decline(call_id, user).await?,
            CallAction::Leave => server.calls.leave(call_id, user).await?,
        };
        Ok::<_, ChatError>(CallView::from(call))
    }
    .await;
    Ok(match result {
        Ok(view) => warp::reply::json(&view).into_response(),
        Err(e) => error_reply(&e),
    })
}

async fn call_status(call_id: CallId, identity: Identity, server: Arc<Server>) -> std::result::Result<Response, Infallible> {
    reply(
        async {
            let user = identity.require_user()?;
            server.calls.status(call_id, user).await.map(CallView::from)
        }
        .await,
    )
}

/// Every route the service exposes: the chat websocket plus the JSON API for
/// rooms, reactions, history polling and voice calls.
pub fn routes(server: Arc<Server>) -> BoxedFilter<(Response,)> {
    let chat_ws = warp::path!("ws" / "chat" / RoomId)
        .and(warp::ws())
        .and(warp::query::<WsQuery>())
        .and(with_server(server.clone()))
        .and_then(upgrade);

    let direct_room = warp::path!("rooms" / "direct")
        .and(warp::post())
        .and(identity())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(create_direct_room);

    let group_room = warp::path!("rooms" / "group")
        .and(warp::post())
        .and(identity())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(create_group_room);

    let room = warp::path!("rooms" / RoomId)
        .and(warp::get())
        .and(identity())
        .and(with_server(server.clone()))
        .and_then(get_room);

    let send = warp::path!("rooms" / RoomId / "messages")
        .and(warp::post())
        .and(identity())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(send_message);

    let reactions = warp::path!("messages" / MessageId / "reactions")
        .and(warp::post())
        .and(identity())
        .and(json_body())
        .and(with_server(server.clone()))
        .and_then(react);

    let poll = warp::path!("rooms" / RoomId / "poll")
        .and(warp::get())
        .and(identity())
        .and(warp::query::<PollQuery>())
        .and(with_server(server.clone()))
        .and_then(poll_messages);

    let read = warp::path!("rooms" / RoomId / "read")
        .and(warp::post())
        .and(identity())
        .and(with_server(server.clone()))
        .and_then(mark_read);

    let start_call = warp::path!("rooms" / RoomId / "calls")
        .and(warp::post())
        .and(identity())
        .and(with_server(server.clone()))
        .and_then(initiate_call);

    let active = warp::path!("rooms" / RoomId / "calls" / "active")
        .and(warp::get())
        .and(identity())
        .and(with_server(server.clone()))
        .and_then(active_call);

    let action = warp::path!("calls" / CallId / String)
        .and(warp::post())
        .and(identity())
        .and(with_server(server.clone()))
        .and_then(call_action);

    let status = warp::path!("calls" / CallId)
        .and(warp::get())
        .and(identity())
        .and(with_server(server))
        .and_then(call_status);

    chat_ws
        .or(direct_room)
        .unify()
        .or(group_room)
        .unify()
        .or(room)
        .unify()
        .or(send)
        .unify()
        .or(reactions)
        .unify()
        .or(poll)
        .unify()
        .or(read)
        .unify()
        .or(start_call)
        .unify()
        .or(active)
        .unify()
        .or(action)
        .unify()
        .or(status)
        .unify()
        .boxed()
}

/// Fallback for requests no route accepted.
pub async fn handle_rejection(rejection: warp::Rejection) -> std::result::Result<Response, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
    } else {
        debug!("Unhandled rejection: {:?}", rejection);
        (StatusCode::BAD_REQUEST, "Bad request".to_string())
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            status: "error",
            message,
        }),
        status,
    )
    .into_response())
}
