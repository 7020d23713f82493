use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::auth::Identity;

use super::ChatError;

pub const ANONYMOUS: &str = "Anonymous";

/// A stored chat message. Same shape for history replay and live broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub author_name: String,
    pub content: String,
    pub display_color: String,
    pub author_is_privileged: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A validated message on its way into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub author_name: String,
    pub content: String,
    pub display_color: String,
    pub author_is_privileged: bool,
}

/// What a client sends. `username`, `message` and `color` are accepted for older clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Submission {
    #[serde(default, alias = "username")]
    pub author_name: Option<String>,
    #[serde(default, alias = "message")]
    pub content: String,
    #[serde(default, alias = "color")]
    pub display_color: Option<String>,

    // never taken from the wire
    #[serde(skip)]
    pub author_is_privileged: bool,
}

impl Submission {
    pub fn new(author_name: impl Into<String>, content: impl Into<String>) -> Submission {
        Submission {
            author_name: Some(author_name.into()),
            content: content.into(),
            ..Default::default()
        }
    }

    /// Overwrites the fields the server decides for an authenticated author.
    ///
    /// Name and privilege come from the identity; the color stays client-chosen and falls back to
    /// the identity's color. Guests keep their own name and are never privileged.
    pub fn attribute(mut self, identity: Option<&Identity>) -> Submission {
        match identity {
            Some(identity) => {
                self.author_name = Some(identity.name.clone());
                self.author_is_privileged = identity.role.is_admin();
                if non_blank(self.display_color.as_deref()).is_none() {
                    self.display_color = Some(identity.display_color.clone());
                }
            }
            None => self.author_is_privileged = false,
        }
        self
    }

    pub fn validate(self, default_color: &str) -> Result<NewMessage, ChatError> {
        let content = self.content.trim();
        if content.is_empty() {
            return Err(ChatError::InvalidMessage);
        }

        Ok(NewMessage {
            author_name: non_blank(self.author_name.as_deref()).unwrap_or(ANONYMOUS).to_owned(),
            content: content.to_owned(),
            display_color: non_blank(self.display_color.as_deref()).unwrap_or(default_color).to_owned(),
            author_is_privileged: self.author_is_privileged,
        })
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// An item in a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(Arc<Message>),
    Error(ErrorFrame),
}

impl Outbound {
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Outbound::Message(message) => serde_json::to_string(&**message),
            Outbound::Error(frame) => serde_json::to_string(frame),
        }
    }
}

/// Sent to the submitting connection only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    pub detail: String,
}

impl ErrorFrame {
    pub fn malformed(detail: impl ToString) -> ErrorFrame {
        ErrorFrame {
            error: "malformed".to_owned(),
            detail: detail.to_string(),
        }
    }
}

impl From<&ChatError> for ErrorFrame {
    fn from(err: &ChatError) -> Self {
        let error = match err {
            ChatError::InvalidMessage => "invalid_message",
            ChatError::Storage(_) => "storage_failure",
        };
        ErrorFrame {
            error: error.to_owned(),
            detail: err.to_string(),
        }
    }
}
