//! Process-based sandbox
//!
//! Runs the script either with a local interpreter (CPU rlimit, killed on
//! timeout) or inside a throwaway container with the user's volume mounted
//! at `/cache`:
//!
//! ```text
//! Local:     cd <root>/<volume> && python3 -u <script>
//! Container: docker run --rm --name pyagent-<id> -v <root>/<volume>:/cache -w /cache \
//!                [--cpus N] [--memory Nm] [--network none] <image> python -u <script>
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExecutionOutput, ExecutionRequest, SandboxError, SandboxExecutor};
use crate::storage::validate_name;

/// Mount point of the user volume inside a container
pub const CONTAINER_WORKDIR: &str = "/cache";

/// `docker run` exits with 125 when the runtime itself failed
const CONTAINER_RUNTIME_FAILURE: i32 = 125;

/// Whether a container run failed in the runtime rather than in user code
///
/// Exit code 125 alone is not enough: scripts may exit with it too. The
/// runtime also writes nothing to stdout and prefixes its own diagnostics
/// with the CLI name (`docker: Error response from daemon: ...`).
fn is_runtime_failure(runtime: &str, exit_code: i32, stdout: &str, stderr: &str) -> bool {
    if exit_code != CONTAINER_RUNTIME_FAILURE || !stdout.is_empty() {
        return false;
    }
    let cli = Path::new(runtime)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| runtime.to_string());
    let prefix = format!("{}:", cli);
    stderr.lines().any(|line| line.starts_with(&prefix))
}

/// How the interpreter process is started
#[derive(Debug, Clone)]
pub enum Launcher {
    /// Interpreter on the host, working directory = volume directory
    Local { python: String },
    /// Fresh container per execution
    Container {
        /// Container CLI, e.g. "docker" or "podman"
        runtime: String,
        /// Execution image with the scientific Python stack installed
        image: String,
        cpus: Option<f64>,
        memory_mb: Option<u64>,
        /// Whether executed code may reach the network
        network: bool,
    },
}

impl Launcher {
    fn program(&self) -> &str {
        match self {
            Launcher::Local { python } => python,
            Launcher::Container { runtime, .. } => runtime,
        }
    }
}

/// Sandbox running each script in a child process
pub struct ProcessSandbox {
    volumes_root: PathBuf,
    launcher: Launcher,
}

impl ProcessSandbox {
    /// # Arguments
    /// * `volumes_root` - Directory holding the user volumes (same root as `LocalVolumes`)
    /// * `launcher` - How to start the interpreter
    pub fn new(volumes_root: impl Into<PathBuf>, launcher: Launcher) -> Self {
        Self {
            volumes_root: volumes_root.into(),
            launcher,
        }
    }

    pub fn local(volumes_root: impl Into<PathBuf>, python: impl Into<String>) -> Self {
        Self::new(
            volumes_root,
            Launcher::Local {
                python: python.into(),
            },
        )
    }

    fn command(&self, request: &ExecutionRequest, workdir: &Path, container_name: &str) -> Command {
        match &self.launcher {
            Launcher::Local { python } => {
                let mut cmd = Command::new(python);
                cmd.arg("-u").arg(&request.script).current_dir(workdir);
                cmd.env("MPLBACKEND", "Agg");
                for (key, value) in &request.env {
                    cmd.env(key, value);
                }
                limit_cpu(&mut cmd, request.timeout.as_secs() + 1);
                cmd
            }
            Launcher::Container {
                runtime,
                image,
                cpus,
                memory_mb,
                network,
            } => {
                let mut cmd = Command::new(runtime);
                cmd.arg("run")
                    .arg("--rm")
                    .arg("--name")
                    .arg(container_name)
                    .arg("-v")
                    .arg(format!("{}:{}", workdir.display(), CONTAINER_WORKDIR))
                    .arg("-w")
                    .arg(CONTAINER_WORKDIR)
                    .arg("-e")
                    .arg("MPLBACKEND=Agg");
                if let Some(cpus) = cpus {
                    cmd.arg("--cpus").arg(cpus.to_string());
                }
                if let Some(memory_mb) = memory_mb {
                    cmd.arg("--memory").arg(format!("{}m", memory_mb));
                }
                if !network {
                    cmd.arg("--network").arg("none");
                }
                for (key, value) in &request.env {
                    cmd.arg("-e").arg(format!("{}={}", key, value));
                }
                cmd.arg(image).arg("python").arg("-u").arg(&request.script);
                cmd
            }
        }
    }

    /// Absolute directory of `volume`
    ///
    /// Container runtimes read a relative mount source as a named volume, so
    /// the path is always canonicalized.
    async fn resolve_workdir(&self, volume: &str) -> Result<PathBuf, SandboxError> {
        let workdir = self.volumes_root.join(volume);
        if !workdir.is_dir() {
            return Err(SandboxError::Provisioning(format!(
                "volume {} is not mounted at {}",
                volume,
                workdir.display()
            )));
        }
        tokio::fs::canonicalize(&workdir).await.map_err(|e| {
            SandboxError::Provisioning(format!("cannot resolve {}: {}", workdir.display(), e))
        })
    }

    /// Force-remove a container left running after its CLI was killed
    async fn remove_container(&self, runtime: &str, name: &str) {
        let result = Command::new(runtime)
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container = %name, error = %e, "Failed to remove timed-out container");
        }
    }
}

/// Cap CPU seconds for the interpreter so a busy loop cannot outlive the
/// wall-clock budget even if the kill is missed
#[cfg(unix)]
fn limit_cpu(cmd: &mut Command, seconds: u64) {
    use nix::sys::resource::{setrlimit, Resource};

    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            setrlimit(Resource::RLIMIT_CPU, seconds, seconds + 1).map_err(std::io::Error::from)
        });
    }
}

#[cfg(not(unix))]
fn limit_cpu(_cmd: &mut Command, _seconds: u64) {}

#[async_trait]
impl SandboxExecutor for ProcessSandbox {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, SandboxError> {
        validate_name(&request.volume).map_err(|e| SandboxError::Provisioning(e.to_string()))?;
        validate_name(&request.script).map_err(|e| SandboxError::Provisioning(e.to_string()))?;

        let workdir = self.resolve_workdir(&request.volume).await?;
        let container_name = format!("pyagent-{}", Uuid::now_v7());
        let mut cmd = self.command(&request, &workdir, &container_name);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            volume = %request.volume,
            script = %request.script,
            program = %self.launcher.program(),
            timeout_secs = request.timeout.as_secs_f64(),
            "Starting sandbox process"
        );

        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            SandboxError::Provisioning(format!("failed to start {}: {}", self.launcher.program(), e))
        })?;

        // Dropping the wait future on timeout drops the child, which kills it
        let result = timeout(request.timeout, child.wait_with_output()).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code().unwrap_or(-1);

                if let Launcher::Container { runtime, .. } = &self.launcher {
                    if is_runtime_failure(runtime, exit_code, &stdout, &stderr) {
                        return Err(SandboxError::Provisioning(stderr.trim().to_string()));
                    }
                }

                info!(exit_code, duration_ms, "Sandbox execution complete");
                Ok(ExecutionOutput {
                    stdout,
                    stderr,
                    exit_code,
                    duration_ms,
                })
            }
            Ok(Err(e)) => Err(SandboxError::Provisioning(format!(
                "failed waiting for sandbox process: {}",
                e
            ))),
            Err(_) => {
                warn!(timeout_secs = request.timeout.as_secs_f64(), "Sandbox execution timed out");
                if let Launcher::Container { runtime, .. } = &self.launcher {
                    self.remove_container(runtime, &container_name).await;
                }
                Err(SandboxError::Timeout {
                    limit: request.timeout,
                })
            }
        }
    }
}
