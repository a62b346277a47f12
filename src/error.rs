use thiserror::Error;
use warp::http::StatusCode;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Room {0} does not exist")]
    RoomNotFound(i64),
    #[error("Message {0} does not exist")]
    MessageNotFound(i64),
    #[error("Voice call {0} does not exist")]
    CallNotFound(i64),
    #[error("You are not a participant in this chat room")]
    NotMember,
    #[error("An identified user is required")]
    Anonymous,
    #[error("Message cannot be empty")]
    EmptyMessage,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Invalid room: {0}")]
    InvalidRoom(String),
    #[error("This call has ended")]
    CallEnded,
    #[error("Storage failure: {0}")]
    Storage(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl ChatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::RoomNotFound(_) | ChatError::MessageNotFound(_) | ChatError::CallNotFound(_) => {
                StatusCode::NOT_FOUND
            },
            ChatError::NotMember | ChatError::Anonymous => StatusCode::FORBIDDEN,
            ChatError::EmptyMessage | ChatError::InvalidMessage(_) | ChatError::InvalidRoom(_) => StatusCode::BAD_REQUEST,
            ChatError::CallEnded => StatusCode::CONFLICT,
            ChatError::Storage(_)
            | ChatError::Database(_)
            | ChatError::Pool(_)
            | ChatError::Json(_)
            | ChatError::TaskJoin(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors that are the caller's fault rather than the server's.
    pub fn is_rejection(&self) -> bool {
        self.status_code().is_client_error()
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
