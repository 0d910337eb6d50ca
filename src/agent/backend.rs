//! Upstream model interface
//!
//! The loop only needs an incremental stream of reply events for a given
//! conversation. Transports (Ollama, test doubles) implement
//! [`ModelBackend`].

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::Stream;

use crate::protocol::Turn;

/// One item of a streamed model reply
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Text fragment to append to the reply
    Text(String),
    /// Replace everything received so far
    Replace(String),
    /// Suggested follow-up the user may click
    SuggestedReply(String),
    /// Transport metadata, ignored by the loop
    Meta(serde_json::Value),
}

/// Error type for upstream model calls
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model error: {0}")]
    Upstream(String),
    #[error("failed to parse model stream: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ModelError>> + Send>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Start streaming a reply to `conversation`
    async fn stream_reply(&self, conversation: &[Turn]) -> Result<ReplyStream, ModelError>;

    /// Name reported in logs and metrics
    fn model_name(&self) -> &str {
        "unknown"
    }
}
