//! Agent Controller - round loop for model-driven code execution
//!
//! Each round streams a model reply to the caller, runs the python blocks it
//! contains in the user's sandbox, forwards output and plots, and appends a
//! simulated feedback turn so the next reply can build on the result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::backend::{ModelBackend, ModelError, ModelEvent};
use super::extract::{extract_code, has_code};
use super::feedback::{
    error_block, image_reference, output_block, synthesize, truncate_output, ImageOutcome,
    OUTPUT_TRUNCATED_NOTICE,
};
use super::prepare::{annotate_attachments, download_attachments, redact_image_links};
use super::sessions::{state_file_name, ConversationLocks, SessionStore};
use super::wrapper::{wrap_session, IMAGE_FILENAME};
use crate::artifact::ImageHost;
use crate::fetch::{FetchError, Fetcher};
use crate::links::augment_with_links;
use crate::metrics::{
    ARTIFACT_UPLOADS, CODE_EXECUTIONS, CODE_EXECUTION_DURATION, MODEL_STREAM_DURATION, REQUESTS,
    ROUNDS,
};
use crate::protocol::{QueryRequest, ResponseEvent, Turn};
use crate::sandbox::{ExecutionOutput, ExecutionRequest, SandboxError, SandboxExecutor};
use crate::storage::{sanitize_file_stem, PersistentArea, StorageError, VolumeProvider};

/// Shown to the user when a round runs past its time budget
pub const TIME_LIMIT_MESSAGE: &str = "Time limit exceeded.";

/// Shown to the user when the sandbox cannot be started
pub const SANDBOX_UNAVAILABLE_MESSAGE: &str = "The code could not be run because the sandbox is unavailable.";

/// Environment variable carrying the request trace id into the sandbox
pub const TRACE_ID_ENV: &str = "PYAGENT_TRACE_ID";

/// Configuration for the agent controller
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hard cap on rounds per request
    pub max_rounds: usize,
    /// Wall-clock budget for one sandbox execution
    pub execution_timeout: Duration,
    /// Output and error text beyond this many characters is cut
    pub max_output_chars: usize,
    /// Strip image links from earlier turns before calling the model
    pub redact_image_links: bool,
    /// Inline the content of URLs found in the latest user turn
    pub link_aware: bool,
    /// Run requests for the same conversation one at a time
    pub serialize_conversations: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            execution_timeout: crate::sandbox::DEFAULT_TIMEOUT,
            max_output_chars: 5000,
            redact_image_links: true,
            link_aware: false,
            serialize_conversations: true,
        }
    }
}

/// How a request's loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The model replied without code
    Completed,
    /// Every allowed round executed code
    RoundLimitReached,
    /// A sandbox execution ran past its budget
    TimeLimitExceeded,
    /// The sandbox could not be provisioned
    SandboxUnavailable,
    /// The caller stopped listening
    Disconnected,
}

impl LoopOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            LoopOutcome::Completed => "completed",
            LoopOutcome::RoundLimitReached => "round_limit",
            LoopOutcome::TimeLimitExceeded => "timeout",
            LoopOutcome::SandboxUnavailable => "sandbox_unavailable",
            LoopOutcome::Disconnected => "disconnected",
        }
    }
}

/// Result of an agent run
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub outcome: LoopOutcome,
    /// Number of model replies requested
    pub rounds: usize,
    /// Records of all completed code executions
    pub execution_records: Vec<ExecutionRecord>,
    /// Conversation including appended replies and feedback turns
    pub conversation: Vec<Turn>,
    /// Unique trace ID for this agent run
    pub trace_id: String,
}

/// Record of a single code execution
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub round: usize,
    /// Code extracted from the reply, before wrapping
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: f64,
    /// Public URL of the plot produced in this round
    pub image_url: Option<String>,
    /// Variables persisted in the session state after this round
    pub session_variables: Vec<String>,
}

/// Request-fatal errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model stream failed: {0}")]
    Model(#[from] ModelError),
    #[error("attachment download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("persistent area failure: {0}")]
    Storage(#[from] StorageError),
}

/// Outbound event sink that remembers when the receiver went away
struct Outbox {
    tx: mpsc::Sender<ResponseEvent>,
    closed: bool,
}

impl Outbox {
    fn new(tx: mpsc::Sender<ResponseEvent>) -> Self {
        Self { tx, closed: false }
    }

    async fn send(&mut self, event: ResponseEvent) {
        if self.closed {
            return;
        }
        if self.tx.send(event).await.is_err() {
            debug!("Event receiver dropped, no longer forwarding");
            self.closed = true;
        }
    }

    async fn text(&mut self, text: impl Into<String>) {
        self.send(ResponseEvent::text(text)).await;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// What one round decided
enum RoundStep {
    Continue,
    Finish(LoopOutcome),
}

/// Everything a round needs that lives for the whole request
struct RequestScope<'a> {
    trace_id: &'a str,
    conversation_id: &'a str,
    script: String,
    area: Arc<dyn PersistentArea>,
    outbox: Outbox,
    conversation: Vec<Turn>,
    records: Vec<ExecutionRecord>,
}

/// Agent Controller orchestrating the model, the sandbox and the user's area
pub struct AgentController {
    model: Arc<dyn ModelBackend>,
    sandbox: Arc<dyn SandboxExecutor>,
    volumes: Arc<dyn VolumeProvider>,
    images: Arc<dyn ImageHost>,
    fetcher: Arc<dyn Fetcher>,
    config: AgentConfig,
    locks: ConversationLocks,
}

impl AgentController {
    /// Create a new agent controller
    ///
    /// # Arguments
    /// * `model` - Upstream model producing the streamed replies
    /// * `sandbox` - Where extracted code runs
    /// * `volumes` - Per-user persistent areas, mounted into the sandbox
    /// * `images` - Where plots are published
    /// * `fetcher` - Downloads attachments and linked pages
    /// * `config` - Agent configuration
    pub fn new(
        model: Arc<dyn ModelBackend>,
        sandbox: Arc<dyn SandboxExecutor>,
        volumes: Arc<dyn VolumeProvider>,
        images: Arc<dyn ImageHost>,
        fetcher: Arc<dyn Fetcher>,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            sandbox,
            volumes,
            images,
            fetcher,
            config,
            locks: ConversationLocks::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the agent loop in the background and expose its events as a stream
    pub fn stream(
        self: Arc<Self>,
        request: QueryRequest,
    ) -> (
        ReceiverStream<ResponseEvent>,
        JoinHandle<Result<AgentResult, AgentError>>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(async move { self.run(request, tx).await });
        (ReceiverStream::new(rx), handle)
    }

    /// Run the agent loop for one request
    ///
    /// # Arguments
    /// * `request` - Conversation so far plus user and conversation identifiers
    /// * `events` - Receives every user-visible event, in order
    ///
    /// # Returns
    /// AgentResult describing how the loop ended and what was executed
    pub async fn run(
        &self,
        request: QueryRequest,
        events: mpsc::Sender<ResponseEvent>,
    ) -> Result<AgentResult, AgentError> {
        let trace_id = Uuid::now_v7().to_string();

        let root_span = info_span!(
            "agent_request",
            trace_id = %trace_id,
            user_id = %request.user_id,
            conversation_id = %request.conversation_id,
            model = %self.model.model_name(),
            otel.name = "agent_request"
        );

        async {
            let result = self.run_request(request, events, &trace_id).await;
            match &result {
                Ok(run) => {
                    info!(
                        trace_id = %trace_id,
                        outcome = run.outcome.as_label(),
                        rounds = run.rounds,
                        executions = run.execution_records.len(),
                        "Agent request finished"
                    );
                    REQUESTS.with_label_values(&[run.outcome.as_label()]).inc();
                    ROUNDS.observe(run.rounds as f64);
                }
                Err(e) => {
                    warn!(trace_id = %trace_id, error = %e, "Agent request failed");
                    REQUESTS.with_label_values(&["failed"]).inc();
                }
            }
            result
        }
        .instrument(root_span)
        .await
    }

    async fn run_request(
        &self,
        request: QueryRequest,
        events: mpsc::Sender<ResponseEvent>,
        trace_id: &str,
    ) -> Result<AgentResult, AgentError> {
        let QueryRequest {
            query: mut conversation,
            user_id,
            conversation_id,
            ..
        } = request;

        // Keyed on the state file so requests sharing one document queue up
        let _guard = if self.config.serialize_conversations {
            Some(self.locks.acquire(&state_file_name(&conversation_id)).await)
        } else {
            None
        };

        let area = self.volumes.open(&user_id).await?;
        download_attachments(&conversation, area.as_ref(), self.fetcher.as_ref()).await?;
        annotate_attachments(&mut conversation);
        if self.config.redact_image_links {
            let removed = redact_image_links(&mut conversation);
            if removed > 0 {
                debug!(removed, "Redacted image links from history");
            }
        }
        if self.config.link_aware {
            let inlined = augment_with_links(&mut conversation, self.fetcher.as_ref()).await;
            debug!(inlined, "Inlined linked pages");
        }

        let mut scope = RequestScope {
            trace_id,
            conversation_id: &conversation_id,
            script: format!("{}.py", sanitize_file_stem(&user_id)),
            area,
            outbox: Outbox::new(events),
            conversation,
            records: Vec::new(),
        };

        let mut rounds = 0;
        let outcome = loop {
            if rounds == self.config.max_rounds {
                warn!(trace_id = %trace_id, rounds, "Round limit reached");
                break LoopOutcome::RoundLimitReached;
            }
            rounds += 1;

            let round_span = info_span!(
                "agent_round",
                trace_id = %trace_id,
                round = rounds,
                otel.name = "agent_round"
            );
            match self.round(&mut scope, rounds).instrument(round_span).await? {
                RoundStep::Continue => {}
                RoundStep::Finish(outcome) => break outcome,
            }
        };

        Ok(AgentResult {
            outcome,
            rounds,
            execution_records: scope.records,
            conversation: scope.conversation,
            trace_id: trace_id.to_string(),
        })
    }

    /// One round: stream a reply, run its code, feed the result back
    async fn round(&self, scope: &mut RequestScope<'_>, round: usize) -> Result<RoundStep, AgentError> {
        let reply = self.stream_reply(scope).await?;
        let code = extract_code(&reply);
        scope.conversation.push(Turn::bot(reply));

        if scope.outbox.is_closed() {
            return Ok(RoundStep::Finish(LoopOutcome::Disconnected));
        }
        if code.trim().is_empty() {
            info!(trace_id = %scope.trace_id, round, "Reply has no code, done");
            return Ok(RoundStep::Finish(LoopOutcome::Completed));
        }

        let wrapped = wrap_session(&code, scope.conversation_id);
        scope.area.put(&scope.script, wrapped.into_bytes()).await?;
        // A plot left by an interrupted run must not be attributed to this one
        scope.area.delete(IMAGE_FILENAME).await?;

        let output = match self.execute(scope, &code).await {
            Ok(output) => output,
            Err(SandboxError::Timeout { limit }) => {
                warn!(trace_id = %scope.trace_id, round, limit_secs = limit.as_secs(), "Execution timed out");
                scope.outbox.text(format!("\n\n{}", TIME_LIMIT_MESSAGE)).await;
                return Ok(RoundStep::Finish(LoopOutcome::TimeLimitExceeded));
            }
            Err(SandboxError::Provisioning(reason)) => {
                warn!(trace_id = %scope.trace_id, round, reason = %reason, "Sandbox unavailable");
                scope.outbox.text(format!("\n\n{}", SANDBOX_UNAVAILABLE_MESSAGE)).await;
                return Ok(RoundStep::Finish(LoopOutcome::SandboxUnavailable));
            }
        };

        let limit = self.config.max_output_chars;
        let (stdout, stdout_cut) = truncate_output(&output.stdout, limit);
        let (stderr, stderr_cut) = truncate_output(&output.stderr, limit);
        if !stdout.is_empty() {
            scope.outbox.text(output_block(stdout)).await;
        }
        if !stderr.is_empty() {
            scope.outbox.text(error_block(stderr)).await;
        }
        if stdout_cut || stderr_cut {
            scope.outbox.text(OUTPUT_TRUNCATED_NOTICE).await;
        }

        let image_url = self.publish_image(scope).await?;
        let image = ImageOutcome::from_run(&code, image_url.is_some());
        scope.conversation.push(Turn::bot(synthesize(stdout, stderr, image)));

        let session_variables = SessionStore::load(scope.area.as_ref(), scope.conversation_id)
            .await
            .map(|state| state.variable_names())
            .unwrap_or_default();
        debug!(variables = session_variables.len(), "Session state after round");

        scope.records.push(ExecutionRecord {
            round,
            code,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration_ms: output.duration_ms,
            image_url,
            session_variables,
        });

        if scope.outbox.is_closed() {
            return Ok(RoundStep::Finish(LoopOutcome::Disconnected));
        }
        Ok(RoundStep::Continue)
    }

    /// Forward the model reply as it arrives, stopping once a complete code
    /// block is in hand
    async fn stream_reply(&self, scope: &mut RequestScope<'_>) -> Result<String, AgentError> {
        let start = Instant::now();
        let mut stream = self.model.stream_reply(&scope.conversation).await?;
        let mut reply = String::new();

        while let Some(event) = stream.next().await {
            match event? {
                ModelEvent::Text(text) => {
                    reply.push_str(&text);
                    scope.outbox.send(ResponseEvent::Text(text)).await;
                }
                ModelEvent::Replace(text) => {
                    reply = text.clone();
                    scope.outbox.send(ResponseEvent::ReplaceResponse(text)).await;
                }
                ModelEvent::SuggestedReply(text) => {
                    scope.outbox.send(ResponseEvent::SuggestedReply(text)).await;
                    continue;
                }
                ModelEvent::Meta(_) => continue,
            }
            if scope.outbox.is_closed() {
                break;
            }
            if has_code(&reply) {
                debug!(trace_id = %scope.trace_id, "Complete code block received, stopping stream");
                break;
            }
        }

        MODEL_STREAM_DURATION
            .with_label_values(&[self.model.model_name()])
            .observe(start.elapsed().as_secs_f64());
        Ok(reply)
    }

    /// Run the wrapped script in the user's volume
    ///
    /// The trace_id is propagated to the interpreter via the `PYAGENT_TRACE_ID`
    /// environment variable.
    async fn execute(&self, scope: &RequestScope<'_>, code: &str) -> Result<ExecutionOutput, SandboxError> {
        let exec_span = info_span!(
            "code_execution",
            trace_id = %scope.trace_id,
            volume = %scope.area.name(),
            code_len = code.len(),
            otel.name = "code_execution"
        );

        let request = ExecutionRequest::new(scope.area.name(), scope.script.as_str())
            .with_timeout(self.config.execution_timeout)
            .with_env(TRACE_ID_ENV, scope.trace_id);

        let start = Instant::now();
        let result = self.sandbox.execute(request).instrument(exec_span).await;
        let duration_secs = start.elapsed().as_secs_f64();

        let status = match &result {
            Ok(output) if output.exit_code == 0 => "success",
            Ok(_) => "error",
            Err(SandboxError::Timeout { .. }) => "timeout",
            Err(SandboxError::Provisioning(_)) => "unavailable",
        };
        CODE_EXECUTIONS.with_label_values(&[status]).inc();
        CODE_EXECUTION_DURATION
            .with_label_values(&[status])
            .observe(duration_secs);

        if let Ok(output) = &result {
            info!(
                trace_id = %scope.trace_id,
                exit_code = output.exit_code,
                stdout_len = output.stdout.len(),
                stderr_len = output.stderr.len(),
                duration_ms = output.duration_ms,
                "Code execution finished"
            );
        }
        result
    }

    /// Upload the plot left by the last execution, if any, and remove it
    /// from the user's area
    async fn publish_image(&self, scope: &mut RequestScope<'_>) -> Result<Option<String>, AgentError> {
        if scope.area.list(IMAGE_FILENAME).await?.is_empty() {
            return Ok(None);
        }
        let data = scope.area.get(IMAGE_FILENAME).await?.unwrap_or_default();

        let mut url = None;
        if data.is_empty() {
            debug!("Image file is empty, skipping upload");
        } else {
            let size = data.len();
            match self.images.upload(data, IMAGE_FILENAME).await {
                Ok(uploaded) => {
                    info!(trace_id = %scope.trace_id, size, url = %uploaded, "Published image");
                    ARTIFACT_UPLOADS.with_label_values(&["success"]).inc();
                    scope.outbox.text(image_reference(&uploaded)).await;
                    url = Some(uploaded);
                }
                Err(e) => {
                    warn!(trace_id = %scope.trace_id, error = %e, "Image upload failed");
                    ARTIFACT_UPLOADS.with_label_values(&["error"]).inc();
                }
            }
        }

        scope.area.delete(IMAGE_FILENAME).await?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.max_rounds, 5);
        assert_eq!(config.execution_timeout, Duration::from_secs(30));
        assert_eq!(config.max_output_chars, 5000);
        assert!(config.redact_image_links);
        assert!(!config.link_aware);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(LoopOutcome::Completed.as_label(), "completed");
        assert_eq!(LoopOutcome::TimeLimitExceeded.as_label(), "timeout");
        assert_eq!(LoopOutcome::SandboxUnavailable.as_label(), "sandbox_unavailable");
    }

    #[tokio::test]
    async fn test_outbox_notices_dropped_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let mut outbox = Outbox::new(tx);
        outbox.text("first").await;
        assert!(!outbox.is_closed());

        drop(rx);
        outbox.text("second").await;
        assert!(outbox.is_closed());
    }
}
