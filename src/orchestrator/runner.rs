//! Background-runner markers.
//!
//! When a foreground invocation detaches, it relaunches this program with
//! these environment variables set. The relaunched copy reads them back with
//! [`RunnerMarkers::from_env`] and continues the same session.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};

/// Set to `1` in a relaunched background runner.
pub const BACKGROUND_RUNNER_ENV: &str = "AGENT_RELAY_BACKGROUND_RUNNER";
/// Logical start time, epoch milliseconds as text.
pub const START_TIME_ENV: &str = "AGENT_RELAY_START_TIME";
/// Log file the runner must append to.
pub const LOG_FILE_ENV: &str = "AGENT_RELAY_LOG_FILE";
/// Session key the runner must continue.
pub const SESSION_ENV: &str = "AGENT_RELAY_SESSION";

/// Markers inherited from the parent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerMarkers {
    /// Logical start time handed down by the parent.
    pub start_time: Option<DateTime<Utc>>,
    /// Log file chosen by the parent.
    pub log_path: Option<PathBuf>,
    /// Session key pre-assigned by the parent.
    pub session: Option<String>,
}

impl RunnerMarkers {
    /// Read markers from the process environment.
    ///
    /// Returns `None` unless this process is a background runner.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read markers through an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let flag = lookup(BACKGROUND_RUNNER_ENV)?;
        if flag != "1" {
            return None;
        }

        let start_time = lookup(START_TIME_ENV)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
        let log_path = lookup(LOG_FILE_ENV)
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from);
        let session = lookup(SESSION_ENV).filter(|raw| !raw.is_empty());

        Some(Self {
            start_time,
            log_path,
            session,
        })
    }
}
