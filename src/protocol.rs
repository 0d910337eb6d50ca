//! Conversation types exchanged with the hosting platform
//!
//! A request carries the full ordered turn history plus the identifiers
//! used to scope per-user files and per-conversation session state. The
//! response is a stream of [`ResponseEvent`]s.

use serde::{Deserialize, Serialize};

/// Author of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Bot,
}

/// A file the user attached to a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name as shown to the user (also the name used in the user's area)
    pub name: String,
    /// Retrieval URL
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// One message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn bot(content: impl Into<String>) -> Self {
        Self {
            role: Role::Bot,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.attachments.push(Attachment {
            name: name.into(),
            url: url.into(),
            content_type: None,
        });
        self
    }
}

/// One inbound request: the conversation so far and who it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Ordered turn history, most recent last
    pub query: Vec<Turn>,
    pub user_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl QueryRequest {
    pub fn new(
        query: Vec<Turn>,
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            query,
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            message_id: None,
        }
    }
}

/// Outbound streaming event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "text", rename_all = "snake_case")]
pub enum ResponseEvent {
    /// Append text to the response
    Text(String),
    /// Replace everything sent so far with this text
    ReplaceResponse(String),
    /// Offer a follow-up prompt to the user
    SuggestedReply(String),
}

impl ResponseEvent {
    pub fn text(text: impl Into<String>) -> Self {
        ResponseEvent::Text(text.into())
    }
}
