//! Real-time room chat.
//!
//! Clients join a room over a websocket and receive every chat message,
//! connection notice, voice call event and WebRTC signal sent to that room.
//! Messages from members are stored for later retrieval; clients that cannot
//! keep a socket open poll for anything newer than the last id they saw.

pub mod call;
pub mod chat;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod messages;
pub mod moderation;
pub mod persistence;
pub mod poller;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod signaling;
pub mod store;
pub mod tls;
pub mod voice;

pub use config::{load_config, Config};
pub use error::{ChatError, Result};
pub use server::{routes, Server};
