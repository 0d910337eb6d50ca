//! Environment-driven settings
//!
//! Every knob has a `PYAGENT_*` variable and a default suitable for a
//! single-host setup (local Ollama, local interpreter, volumes under the
//! working directory).

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::sandbox::Launcher;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read system prompt from {path}: {source}")]
    PromptFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which sandbox launcher to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Local,
    Docker,
}

/// Runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub ollama_url: String,
    pub model: String,
    pub system_prompt_file: Option<PathBuf>,
    /// Root directory holding one `vol-<user>` directory per user
    pub volumes_dir: PathBuf,
    pub sandbox: SandboxKind,
    pub python: String,
    pub container_runtime: String,
    pub container_image: String,
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
    /// Whether executed code may use the network (container sandbox only)
    pub network: bool,
    /// Image upload endpoint; plots are written to `image_dir` when unset
    pub image_upload_url: Option<String>,
    pub image_dir: PathBuf,
    pub otlp_endpoint: Option<String>,
    /// Emit logs as JSON lines
    pub log_json: bool,
    pub max_rounds: usize,
    pub execution_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model: "qwen3".to_string(),
            system_prompt_file: None,
            volumes_dir: PathBuf::from("volumes"),
            sandbox: SandboxKind::Local,
            python: "python3".to_string(),
            container_runtime: "docker".to_string(),
            container_image: "pyagent-exec:latest".to_string(),
            cpus: None,
            memory_mb: None,
            network: false,
            image_upload_url: None,
            image_dir: PathBuf::from("images"),
            otlp_endpoint: None,
            log_json: false,
            max_rounds: 5,
            execution_timeout: crate::sandbox::DEFAULT_TIMEOUT,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for absent
    /// or empty variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Settings::default();

        if let Some(v) = get("PYAGENT_OLLAMA_URL") {
            settings.ollama_url = v;
        }
        if let Some(v) = get("PYAGENT_MODEL") {
            settings.model = v;
        }
        settings.system_prompt_file = get("PYAGENT_SYSTEM_PROMPT_FILE").map(PathBuf::from);
        if let Some(v) = get("PYAGENT_VOLUMES_DIR") {
            settings.volumes_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PYAGENT_SANDBOX") {
            settings.sandbox = match v.trim().to_ascii_lowercase().as_str() {
                "local" => SandboxKind::Local,
                "docker" | "container" => SandboxKind::Docker,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "PYAGENT_SANDBOX",
                        value: v,
                        reason: "expected local or docker".to_string(),
                    })
                }
            };
        }
        if let Some(v) = get("PYAGENT_PYTHON") {
            settings.python = v;
        }
        if let Some(v) = get("PYAGENT_CONTAINER_RUNTIME") {
            settings.container_runtime = v;
        }
        if let Some(v) = get("PYAGENT_CONTAINER_IMAGE") {
            settings.container_image = v;
        }
        if let Some(v) = get("PYAGENT_CPUS") {
            settings.cpus = Some(parse("PYAGENT_CPUS", v)?);
        }
        if let Some(v) = get("PYAGENT_MEMORY_MB") {
            settings.memory_mb = Some(parse("PYAGENT_MEMORY_MB", v)?);
        }
        if let Some(v) = get("PYAGENT_NETWORK") {
            settings.network = parse_bool("PYAGENT_NETWORK", v)?;
        }
        settings.image_upload_url = get("PYAGENT_IMAGE_UPLOAD_URL");
        if let Some(v) = get("PYAGENT_IMAGE_DIR") {
            settings.image_dir = PathBuf::from(v);
        }
        settings.otlp_endpoint = get("PYAGENT_OTLP_ENDPOINT");
        if let Some(v) = get("PYAGENT_LOG_JSON") {
            settings.log_json = parse_bool("PYAGENT_LOG_JSON", v)?;
        }
        if let Some(v) = get("PYAGENT_MAX_ROUNDS") {
            settings.max_rounds = parse("PYAGENT_MAX_ROUNDS", v)?;
        }
        if let Some(v) = get("PYAGENT_EXECUTION_TIMEOUT_SECS") {
            let secs: f64 = parse("PYAGENT_EXECUTION_TIMEOUT_SECS", v.clone())?;
            if !(secs.is_finite() && secs > 0.0) {
                return Err(ConfigError::Invalid {
                    key: "PYAGENT_EXECUTION_TIMEOUT_SECS",
                    value: v,
                    reason: "must be a positive number of seconds".to_string(),
                });
            }
            settings.execution_timeout = Duration::from_secs_f64(secs);
        }

        Ok(settings)
    }

    /// Sandbox launcher described by these settings
    pub fn launcher(&self) -> Launcher {
        match self.sandbox {
            SandboxKind::Local => Launcher::Local {
                python: self.python.clone(),
            },
            SandboxKind::Docker => Launcher::Container {
                runtime: self.container_runtime.clone(),
                image: self.container_image.clone(),
                cpus: self.cpus,
                memory_mb: self.memory_mb,
                network: self.network,
            },
        }
    }

    /// Agent configuration with the limits from these settings applied
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_rounds: self.max_rounds,
            execution_timeout: self.execution_timeout,
            ..AgentConfig::default()
        }
    }

    /// Contents of the configured system prompt file, if any
    pub fn system_prompt(&self) -> Result<Option<String>, ConfigError> {
        match &self.system_prompt_file {
            Some(path) => std::fs::read_to_string(path)
                .map(Some)
                .map_err(|source| ConfigError::PromptFile {
                    path: path.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }
}
