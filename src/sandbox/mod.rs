//! Sandboxed script execution
//!
//! The agent never runs model-authored code in its own process. A
//! [`SandboxExecutor`] runs a script that already sits in a user's volume,
//! with the volume as the working directory, under a wall-clock budget.
//!
//! Only infrastructure problems are errors here. A script that raises or
//! exits non-zero is a successful execution whose stderr says what went
//! wrong.

pub mod process;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use process::{Launcher, ProcessSandbox};

/// Default execution budget
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What to run
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Volume to mount as the working directory
    pub volume: String,
    /// Script file name inside the volume
    pub script: String,
    /// Wall-clock budget
    pub timeout: Duration,
    /// Extra environment variables for the interpreter
    pub env: HashMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(volume: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            script: script.into(),
            timeout: DEFAULT_TIMEOUT,
            env: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Captured result of one execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: f64,
}

/// Error type for sandbox operations
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The script ran past its budget and was killed
    #[error("execution exceeded the {}s time limit", .limit.as_secs())]
    Timeout { limit: Duration },
    /// The sandbox itself could not be started or reached
    #[error("sandbox unavailable: {0}")]
    Provisioning(String),
}

/// Runs scripts in an isolated environment
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, SandboxError>;
}
