mod broadcast;
mod handler;
mod history;
mod message;
mod registry;
mod send;
mod store;
mod ws;

use axum::{routing::{get, post}, Router};
use thiserror::Error;

use crate::AppState;

pub use broadcast::Broadcaster;
pub use handler::SessionState;
pub use message::{ErrorFrame, Message, NewMessage, Outbound, Submission, ANONYMOUS};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, Snapshot};
pub use store::{MessageStore, SqliteMessageStore};

#[derive(Debug, Error)]
#[error("storage failure: {0}")]
pub struct StorageFailure(#[from] pub sqlx::Error);

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message content is empty")]
    InvalidMessage,
    #[error(transparent)]
    Storage(#[from] StorageFailure),
}

/// A connection that can no longer be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFault {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::chat_ws))
        .route("/messages", get(history::messages))
        .route("/send", post(send::send))
}
