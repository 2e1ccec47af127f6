//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Background execution settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackgroundConfig {
    /// Whether `run --background` may relaunch the program as a runner.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Start runners decoupled from the parent's lifetime with discarded I/O.
    #[serde(default = "default_true")]
    pub detach: bool,
    /// Default delay before the one-shot session identifier check.
    #[serde(default = "default_extraction_delay_ms")]
    pub session_extraction_delay_ms: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detach: true,
            session_extraction_delay_ms: default_extraction_delay_ms(),
        }
    }
}

/// Live stream reconnect settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Initial reconnect delay; doubled on every consecutive attempt.
    #[serde(default = "default_base_reconnect_delay_ms")]
    pub base_reconnect_delay_ms: u64,
    /// Reconnect attempts before a subscription gives up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_reconnect_delay_ms: default_base_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Command template for one executor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Executable to spawn.
    pub command: String,
    /// Arguments placed before the prompt on a fresh run.
    #[serde(default)]
    pub args: Vec<String>,
    /// Arguments placed before the session id and prompt on resume.
    #[serde(default)]
    pub resume_args: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Overrides `background.session_extraction_delay_ms` for this executor.
    #[serde(default)]
    pub session_extraction_delay_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_extraction_delay_ms() -> u64 {
    5000
}

fn default_base_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_abandoned_after_hours() -> u64 {
    24
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".agent-relay").join("state")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".agent-relay").join("logs")
}

fn default_executor() -> String {
    "opencode".into()
}

/// Global configuration parsed from `agent-relay.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding `sessions.json`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory receiving one log file per run.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Executor assigned to sessions that name none (or an unknown one).
    #[serde(default = "default_executor")]
    pub default_executor: String,
    /// Age after which a `running` session without live processes is abandoned.
    #[serde(default = "default_abandoned_after_hours")]
    pub abandoned_after_hours: u64,
    /// Background runner settings.
    #[serde(default)]
    pub background: BackgroundConfig,
    /// Live stream settings.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Executor command templates keyed by executor name.
    #[serde(default)]
    pub executors: HashMap<String, ExecutorConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
            default_executor: default_executor(),
            abandoned_after_hours: default_abandoned_after_hours(),
            background: BackgroundConfig::default(),
            stream: StreamConfig::default(),
            executors: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the persisted session document.
    #[must_use]
    pub fn sessions_path(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    /// Log file for a run of `agent` started at `start_ms` (epoch millis).
    #[must_use]
    pub fn log_path_for(&self, agent: &str, start_ms: i64) -> PathBuf {
        let slug = crate::models::session::slugify(agent);
        self.log_dir.join(format!("{slug}-{start_ms}.log"))
    }

    /// Abandoned-session threshold as a `chrono` duration.
    #[must_use]
    pub fn abandoned_after(&self) -> chrono::Duration {
        i64::try_from(self.abandoned_after_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Default delay before the one-shot session identifier check.
    #[must_use]
    pub fn session_extraction_delay(&self) -> Duration {
        Duration::from_millis(self.background.session_extraction_delay_ms)
    }

    /// Look up an executor template.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no executor with that name is configured.
    pub fn executor(&self, name: &str) -> Result<&ExecutorConfig> {
        self.executors
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("executor {name} is not configured")))
    }

    fn validate(&self) -> Result<()> {
        if self.abandoned_after_hours == 0 {
            return Err(AppError::Config(
                "abandoned_after_hours must be greater than zero".into(),
            ));
        }

        if self.stream.base_reconnect_delay_ms == 0 {
            return Err(AppError::Config(
                "stream.base_reconnect_delay_ms must be greater than zero".into(),
            ));
        }

        if self.default_executor.trim().is_empty() {
            return Err(AppError::Config("default_executor must not be empty".into()));
        }

        for (name, executor) in &self.executors {
            if executor.command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "executors.{name}.command must not be empty"
                )));
            }
        }

        Ok(())
    }
}
