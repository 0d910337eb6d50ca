//! pyagent - chat agent that runs model-written python in a per-user sandbox
//!
//! A request carries a conversation. The agent streams the upstream model's
//! reply to the caller, executes any ```` ```python ```` blocks in the user's
//! sandbox with session state carried across rounds, publishes plots, and
//! feeds the results back to the model until it stops writing code.
//!
//! # Modules
//!
//! - `agent` - Round loop, code extraction, session wrapper, feedback turns
//! - `ollama` - Streaming Ollama `/api/chat` client used as the model
//! - `sandbox` - Time-boxed script execution (local interpreter or container)
//! - `storage` - Per-user persistent file areas
//! - `artifact` - Image publishing
//! - `fetch` / `links` - Attachment downloads and link-aware prompting
//! - `config` - `PYAGENT_*` environment settings
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - Logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pyagent::{
//!     AgentConfig, AgentController, ChatClient, DirectoryImageHost, HttpFetcher, LocalVolumes,
//!     ProcessSandbox,
//! };
//!
//! let controller = AgentController::new(
//!     Arc::new(ChatClient::new("http://localhost:11434", "qwen3")),
//!     Arc::new(ProcessSandbox::local("volumes", "python3")),
//!     Arc::new(LocalVolumes::new("volumes")),
//!     Arc::new(DirectoryImageHost::new("images")),
//!     Arc::new(HttpFetcher::new()),
//!     AgentConfig::default(),
//! );
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! let result = controller.run(request, tx).await?;
//! ```

pub mod agent;
pub mod artifact;
pub mod config;
pub mod fetch;
pub mod links;
pub mod metrics;
pub mod ollama;
pub mod protocol;
pub mod sandbox;
pub mod storage;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentController, AgentError, AgentResult, LoopOutcome};
pub use artifact::{DirectoryImageHost, HttpImageHost, ImageHost};
pub use config::Settings;
pub use fetch::{Fetcher, HttpFetcher};
pub use ollama::ChatClient;
pub use protocol::{QueryRequest, ResponseEvent, Role, Turn};
pub use sandbox::{ProcessSandbox, SandboxExecutor};
pub use storage::{LocalVolumes, PersistentArea, VolumeProvider};
