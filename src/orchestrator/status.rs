//! Display status and housekeeping over the session document.
//!
//! The stored status only records what the coordinator last persisted. When
//! a runner is killed hard, `running` can outlive the processes behind it, so
//! anything shown to a user goes through [`resolve_display_status`], and
//! [`sweep_abandoned`] retires entries nobody will ever finalize.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::supervisor::{ProcessSupervisor, StopSignal};
use crate::models::session::{SessionDocument, SessionEntry, SessionStatus};
use crate::{AppError, Result};

/// Process operations the housekeeping helpers rely on.
pub trait ProcessProbe {
    /// Whether `pid` currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver `signal` to `pid`; `Ok(false)` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Signal` when delivery fails for another reason.
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool>;
}

impl ProcessProbe for ProcessSupervisor {
    fn is_alive(&self, pid: u32) -> bool {
        ProcessSupervisor::is_alive(self, pid)
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<bool> {
        self.stop(pid, signal)
    }
}

/// Status as presented to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    /// A lifecycle status, stored or derived.
    Status(SessionStatus),
    /// Exited non-zero; carries the exit code.
    FailedWithCode(i32),
}

impl Display for DisplayStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(status) => f.write_str(status.as_str()),
            Self::FailedWithCode(code) => write!(f, "failed ({code})"),
        }
    }
}

/// Combine the stored status with live process state.
#[must_use]
pub fn resolve_display_status(entry: &SessionEntry, probe: &dyn ProcessProbe) -> DisplayStatus {
    let alive = |pid: Option<u32>| pid.is_some_and(|pid| probe.is_alive(pid));
    let executor_alive = alive(entry.executor_pid);
    let runner_alive = alive(entry.runner_pid);

    match entry.status {
        SessionStatus::Running => {
            if executor_alive {
                DisplayStatus::Status(SessionStatus::Running)
            } else if runner_alive {
                DisplayStatus::Status(SessionStatus::PendingCompletion)
            } else {
                match entry.exit_code {
                    Some(0) => DisplayStatus::Status(SessionStatus::Completed),
                    Some(code) => DisplayStatus::FailedWithCode(code),
                    None => DisplayStatus::Status(SessionStatus::Stopped),
                }
            }
        }
        SessionStatus::Completed | SessionStatus::Failed => DisplayStatus::Status(entry.status),
        _ if executor_alive || runner_alive => DisplayStatus::Status(SessionStatus::Running),
        other => DisplayStatus::Status(other),
    }
}

/// Mark stale `running`/`starting` entries with no live process as
/// `abandoned`. Returns the affected keys; the caller persists.
pub fn sweep_abandoned(
    document: &mut SessionDocument,
    now: DateTime<Utc>,
    threshold: Duration,
    probe: &dyn ProcessProbe,
) -> Vec<String> {
    let mut swept = Vec::new();
    for (key, entry) in &mut document.sessions {
        if !matches!(entry.status, SessionStatus::Running | SessionStatus::Starting) {
            continue;
        }
        let live = [entry.executor_pid, entry.runner_pid]
            .into_iter()
            .flatten()
            .any(|pid| probe.is_alive(pid));
        if live {
            continue;
        }
        let Some(last_seen) = entry.last_used.or(entry.created) else {
            continue;
        };
        if now - last_seen < threshold {
            continue;
        }
        if !entry.status.can_transition_to(SessionStatus::Abandoned) {
            continue;
        }
        info!(session = %key, previous = %entry.status, "session abandoned");
        entry.status = SessionStatus::Abandoned;
        entry.last_used = Some(now);
        swept.push(key.clone());
    }
    swept
}

/// Signal the processes behind session `key` and record it as `stopped`.
///
/// Both the runner and the executor are signalled when known. Returns
/// whether any signal was delivered; the caller persists.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown key and propagates signal
/// delivery failures.
pub fn stop_session(
    document: &mut SessionDocument,
    key: &str,
    probe: &dyn ProcessProbe,
) -> Result<bool> {
    let entry = document
        .sessions
        .get_mut(key)
        .ok_or_else(|| AppError::NotFound(format!("session {key} not found")))?;

    let mut pids: Vec<u32> = [entry.executor_pid, entry.runner_pid]
        .into_iter()
        .flatten()
        .collect();
    pids.dedup();
    if pids.is_empty() {
        warn!(session = %key, "session has no recorded pid");
    }

    let mut delivered = false;
    for pid in pids {
        delivered |= probe.signal(pid, StopSignal::Terminate)?;
    }

    if delivered && entry.status.can_transition_to(SessionStatus::Stopped) {
        entry.status = SessionStatus::Stopped;
        entry.touch();
        info!(session = %key, "session stopped");
    }
    Ok(delivered)
}
