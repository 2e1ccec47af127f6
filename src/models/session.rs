//! Session entry model and lifecycle helpers.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Schema version written by this build.
pub const CURRENT_VERSION: u32 = 3;

/// Maximum stored length of `last_prompt`, in characters.
pub const LAST_PROMPT_LIMIT: usize = 200;

/// Lifecycle status of one agent invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Entry recorded, child not yet spawned.
    #[default]
    Starting,
    /// Child spawned and executor pid recorded.
    Running,
    /// Executor exited but its runner is still finalizing. Derived only.
    PendingCompletion,
    /// Child exited with code 0.
    Completed,
    /// Child exited non-zero or failed at runtime.
    Failed,
    /// Stopped by an external signal, or no live process and no outcome.
    Stopped,
    /// Left `running` past the age threshold with no live process.
    Abandoned,
    /// Any status string this build does not recognize.
    #[serde(other)]
    Unknown,
}

impl SessionStatus {
    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::PendingCompletion => "pending-completion",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Abandoned => "abandoned",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the status records a final outcome.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Abandoned
        )
    }

    /// Determine whether a stored lifecycle transition is permitted.
    ///
    /// `PendingCompletion` is never stored, so no transition leads to it.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed | Self::Abandoned)
                | (
                    Self::Starting | Self::Running | Self::Unknown,
                    Self::Stopped
                )
                | (Self::Starting | Self::Unknown, Self::Abandoned)
        )
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one agent invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// Agent (template) that was invoked.
    #[serde(default)]
    pub agent: String,
    /// Friendly name; mirrors the store key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Legacy alias of `mode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    /// Execution mode echoed from configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Executor that ran the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// Executor variant echoed from configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_variant: Option<String>,
    /// Model echoed from configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Identifier reported by the executor itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Opaque remote task identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Opaque remote project identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Stored lifecycle status.
    #[serde(default)]
    pub status: SessionStatus,
    /// Creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Timestamp of the last persisted change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    /// Logical start time of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Truncated prompt, diagnostic only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
    /// Whether the run was detached into a background runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<bool>,
    /// Log sink of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Pid of the background runner, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_pid: Option<u32>,
    /// Pid of the executor child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_pid: Option<u32>,
    /// Exit code once the child has exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Terminating signal name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Runtime error text, if the child failed to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fields written by other tools; preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionEntry {
    /// Construct a `starting` entry for `agent` named `name`.
    #[must_use]
    pub fn new(agent: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent: agent.into(),
            name: Some(name.into()),
            status: SessionStatus::Starting,
            created: Some(now),
            last_used: Some(now),
            start_time: Some(now),
            ..Self::default()
        }
    }

    /// Store the prompt, truncated to [`LAST_PROMPT_LIMIT`] characters.
    pub fn set_last_prompt(&mut self, prompt: &str) {
        self.last_prompt = Some(prompt.chars().take(LAST_PROMPT_LIMIT).collect());
    }

    /// Refresh `last_used`.
    pub fn touch(&mut self) {
        self.last_used = Some(Utc::now());
    }
}

/// The whole persisted session document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDocument {
    /// Schema version.
    pub version: u32,
    /// Entries keyed by immutable session key.
    pub sessions: BTreeMap<String, SessionEntry>,
}

impl Default for SessionDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl SessionDocument {
    /// Allocate an unused session key for `agent`, based on
    /// [`generate_session_name`].
    #[must_use]
    pub fn allocate_key(&self, agent: &str, now: DateTime<Utc>) -> String {
        let base = generate_session_name(agent, now);
        if !self.sessions.contains_key(&base) {
            return base;
        }
        (2u32..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.sessions.contains_key(candidate))
            .unwrap_or(base)
    }
}

fn non_alnum() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").ok()).as_ref()
}

/// Lowercase `name`, collapse runs of non-alphanumerics into `-`, and trim
/// leading/trailing dashes. Falls back to `session` when nothing remains.
#[must_use]
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let slug = non_alnum().map_or_else(
        || lowered.clone(),
        |re| re.replace_all(&lowered, "-").into_owned(),
    );
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "session".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Friendly session name: `<slug>-<YYMMDDHHmm>`.
#[must_use]
pub fn generate_session_name(agent: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", slugify(agent), now.format("%y%m%d%H%M"))
}
