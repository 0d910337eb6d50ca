//! Agent module for model-driven python execution
//!
//! This module provides the round loop that orchestrates:
//! - a streaming upstream model ([`ModelBackend`])
//! - the user's persistent area and a sandbox mounting it
//! - session state carried across rounds and requests
//!
//! # Architecture
//!
//! ```text
//! QueryRequest → prepare (attachments, redaction, links)
//!                  ↓
//!           ModelBackend.stream_reply() → forwarded to caller
//!                  ↓   (stop once a ```python block closes)
//!           extract_code() ── empty ──→ done
//!                  ↓
//!           wrap_session() → <user>.py in vol-<user>
//!                  ↓
//!           SandboxExecutor.execute() ── timeout / unavailable ──→ message, stop
//!                  ↓
//!           output/error blocks + image.png → ImageHost
//!                  ↓
//!           synthesize() → feedback turn → next round (max 5)
//! ```

pub mod backend;
pub mod controller;
pub mod extract;
pub mod feedback;
pub mod prepare;
pub mod sessions;
pub mod wrapper;

pub use backend::{ModelBackend, ModelError, ModelEvent, ReplyStream};
pub use controller::{
    AgentConfig, AgentController, AgentError, AgentResult, ExecutionRecord, LoopOutcome,
    SANDBOX_UNAVAILABLE_MESSAGE, TIME_LIMIT_MESSAGE, TRACE_ID_ENV,
};
pub use extract::{extract_code, has_code};
pub use feedback::{synthesize, ImageOutcome};
pub use sessions::{ConversationLocks, SessionState, SessionStore, SessionSummary, StateValue};
pub use wrapper::{wrap_session, IMAGE_FILENAME};
