//! Ollama `/api/chat` client with streamed replies

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::backend::{ModelBackend, ModelError, ModelEvent, ReplyStream};
use crate::protocol::{Role, Turn};

/// System prompt used when none is configured
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a Python coding assistant working in a persistent session.

When code would help answer the user, write it in a single ```python block. The user will run it and reply with its output or error.
- Variables, functions you define and imported data persist between your replies.
- Files the user mentions are in the current directory; files you write there persist too.
- To show a chart, use matplotlib and call plt.show(); the image is captured and shown to the user.
- If the code fails, read the error and send a corrected block.
- When you have the answer, reply in plain text without a code block."#;

/// A message in an `/api/chat` conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        match turn.role {
            Role::System => ChatMessage::system(turn.content.clone()),
            Role::User => ChatMessage::user(turn.content.clone()),
            Role::Bot => ChatMessage::assistant(turn.content.clone()),
        }
    }
}

/// One NDJSON line of a streamed `/api/chat` response
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

/// Events carried by one NDJSON line, and whether it was the last one
fn events_from_line(line: &str) -> Result<(Vec<ModelEvent>, bool), ModelError> {
    let chunk: ChatChunk = serde_json::from_str(line)?;
    if let Some(error) = chunk.error {
        return Err(ModelError::Upstream(error));
    }

    let mut events = Vec::new();
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            events.push(ModelEvent::Text(message.content));
        }
    }
    if chunk.done {
        events.push(ModelEvent::Meta(serde_json::json!({
            "eval_count": chunk.eval_count,
            "eval_duration": chunk.eval_duration,
        })));
    }
    Ok((events, chunk.done))
}

/// Client for Ollama's /api/chat endpoint
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl ChatClient {
    /// Create a new chat client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Ollama server (e.g., "http://localhost:11434")
    /// * `model` - The model name (e.g., "qwen3")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            client: reqwest::Client::new(),
        }
    }

    /// Replace the system prompt; `None` sends the conversation as is
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Messages for a conversation, with the system prompt first unless the
    /// conversation already starts with one
    pub fn messages(&self, conversation: &[Turn]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        let has_system = conversation.first().map(|t| t.role == Role::System).unwrap_or(false);
        if let (Some(prompt), false) = (&self.system_prompt, has_system) {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend(conversation.iter().map(ChatMessage::from));
        messages
    }
}

#[async_trait]
impl ModelBackend for ChatClient {
    async fn stream_reply(&self, conversation: &[Turn]) -> Result<ReplyStream, ModelError> {
        let endpoint = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": self.messages(conversation),
            "stream": true,
        });

        debug!(model = %self.model, turns = conversation.len(), "Starting chat stream");
        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        let stream = async_stream::stream! {
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            let text = String::from_utf8_lossy(&line);
                            let text = text.trim();
                            if text.is_empty() {
                                continue;
                            }
                            match events_from_line(text) {
                                Ok((events, done)) => {
                                    for event in events {
                                        yield Ok(event);
                                    }
                                    if done {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(ModelError::Request(e));
                        return;
                    }
                }
            }

            // Trailing line without newline
            let text = String::from_utf8_lossy(&buf).trim().to_string();
            if !text.is_empty() {
                match events_from_line(&text) {
                    Ok((events, _)) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(client: &ChatClient, conversation: &[Turn]) -> Vec<Result<ModelEvent, ModelError>> {
        let mut stream = client.stream_reply(conversation).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_messages_map_roles_and_prepend_system_prompt() {
        let client = ChatClient::new("http://localhost:11434", "qwen3")
            .with_system_prompt(Some("be brief".into()));
        let messages = client.messages(&[Turn::user("hi"), Turn::bot("hello")]);
        assert_eq!(
            messages,
            vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ]
        );

        let explicit = client.messages(&[Turn::system("own prompt"), Turn::user("hi")]);
        assert_eq!(explicit[0], ChatMessage::system("own prompt"));
        assert_eq!(explicit.len(), 2);
    }

    #[test]
    fn test_events_from_line() {
        let (events, done) =
            events_from_line(r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#).unwrap();
        assert_eq!(events, vec![ModelEvent::Text("Hel".into())]);
        assert!(!done);

        let (events, done) = events_from_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#).unwrap();
        assert!(done);
        assert!(matches!(events.as_slice(), [ModelEvent::Meta(_)]));

        let err = events_from_line(r#"{"error":"model not found"}"#).unwrap_err();
        assert!(matches!(err, ModelError::Upstream(ref m) if m == "model not found"));

        assert!(events_from_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_stream_reply_yields_text_fragments() {
        let server = MockServer::start().await;
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Here "},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":"you go"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true,"eval_count":2}"#, "\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"model": "qwen3", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new(server.uri(), "qwen3");
        let events = collect(&client, &[Turn::user("hi")]).await;
        let texts: Vec<String> = events
            .into_iter()
            .filter_map(|e| match e.unwrap() {
                ModelEvent::Text(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Here ", "you go"]);
    }

    #[tokio::test]
    async fn test_stream_reply_surfaces_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"error\":\"out of memory\"}\n"))
            .mount(&server)
            .await;

        let client = ChatClient::new(server.uri(), "qwen3");
        let events = collect(&client, &[Turn::user("hi")]).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(ModelError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model \"nope\" not found"))
            .mount(&server)
            .await;

        let client = ChatClient::new(server.uri(), "nope");
        let err = match client.stream_reply(&[Turn::user("hi")]).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, ModelError::Status { status: 404, .. }));
    }
}
