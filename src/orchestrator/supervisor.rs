//! Process supervisor for background runners.
//!
//! Launches a child (usually a re-invocation of this program), keeps a
//! [`ProcessRecord`] for it while it lives, and publishes a
//! [`SupervisorEvent`] when it exits or fails. Records are removed from the
//! table before the exit event is sent, so [`ProcessSupervisor::get`] and
//! [`ProcessSupervisor::list`] only ever show live children launched by this
//! instance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{info, info_span, warn};

use super::runner::{
    BACKGROUND_RUNNER_ENV, LOG_FILE_ENV, SESSION_ENV, START_TIME_ENV,
};
use crate::config::BackgroundConfig;
use crate::{AppError, Result};

/// Capacity of the exit/error notification channel.
const EVENT_CAPACITY: usize = 64;

/// Signals the supervisor can deliver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopSignal {
    /// `SIGTERM`.
    #[default]
    Terminate,
    /// `SIGKILL`.
    Kill,
}

#[cfg(unix)]
impl From<StopSignal> for nix::sys::signal::Signal {
    fn from(signal: StopSignal) -> Self {
        match signal {
            StopSignal::Terminate => Self::SIGTERM,
            StopSignal::Kill => Self::SIGKILL,
        }
    }
}

/// Metadata about one supervised child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    /// Operating-system process id.
    pub pid: u32,
    /// Arguments passed to the child after the launch target.
    pub launch_args: Vec<String>,
    /// Log file the child was told to write to.
    pub log_path: Option<PathBuf>,
    /// Logical start time; may be inherited from a parent invocation.
    pub start_time: DateTime<Utc>,
    /// Wall-clock launch time.
    pub launched_at: DateTime<Utc>,
    /// Whether the child was started decoupled from this process.
    pub detached: bool,
    /// Exit code, once exited.
    pub exit_code: Option<i32>,
    /// Terminating signal name, once exited.
    pub signal: Option<String>,
    /// Exit time, once exited.
    pub exited_at: Option<DateTime<Utc>>,
    /// Runtime failure while waiting on the child.
    pub error: Option<String>,
}

/// Notifications published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The child exited; the record carries its final exit fields.
    Exited(ProcessRecord),
    /// Waiting on the child failed.
    Failed {
        /// Record of the child at the time of failure.
        record: ProcessRecord,
        /// Error text.
        error: String,
    },
}

/// Everything needed to start one supervised child.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Program to run.
    pub target: Option<PathBuf>,
    /// Arguments after the target.
    pub launch_args: Vec<String>,
    /// Logical start time to hand down; defaults to now.
    pub start_time: Option<DateTime<Utc>>,
    /// Log file the child should write to.
    pub log_path: Option<PathBuf>,
    /// Session key the child should continue.
    pub session: Option<String>,
    /// Extra environment merged over the inherited one.
    pub env: HashMap<String, String>,
}

/// Owned table of live children plus their notification channel.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: BackgroundConfig,
    children: Arc<Mutex<HashMap<u32, ProcessRecord>>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl ProcessSupervisor {
    /// Construct a supervisor governed by `config`.
    #[must_use]
    pub fn new(config: BackgroundConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            children: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to exit/error notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Launch a child and start supervising it.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if background execution is disabled, no
    /// target was supplied, or the spawn did not produce a pid.
    pub fn launch(&self, request: LaunchRequest) -> Result<u32> {
        if !self.config.enabled {
            return Err(AppError::Launch(
                "background execution is disabled in configuration".into(),
            ));
        }
        let Some(target) = request.target.clone() else {
            return Err(AppError::Launch("launch requires a target".into()));
        };

        let detached = self.config.detach;
        let start_time = request.start_time.unwrap_or_else(Utc::now);
        let span = info_span!("launch", target = %target.display(), detached);
        let _guard = span.enter();

        let mut cmd = Command::new(&target);
        cmd.args(&request.launch_args)
            .envs(&request.env)
            .env(BACKGROUND_RUNNER_ENV, "1")
            .env(START_TIME_ENV, start_time.timestamp_millis().to_string());
        if let Some(log_path) = &request.log_path {
            cmd.env(LOG_FILE_ENV, log_path);
        }
        if let Some(session) = &request.session {
            cmd.env(SESSION_ENV, session);
        }

        if detached {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            #[cfg(unix)]
            cmd.process_group(0);
        } else {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Launch(format!("failed to spawn {}: {err}", target.display())))?;
        let Some(pid) = child.id() else {
            return Err(AppError::Launch("spawn did not produce a pid".into()));
        };

        let record = ProcessRecord {
            pid,
            launch_args: request.launch_args,
            log_path: request.log_path,
            start_time,
            launched_at: Utc::now(),
            detached,
            exit_code: None,
            signal: None,
            exited_at: None,
            error: None,
        };
        self.table().insert(pid, record.clone());
        info!(pid, "background runner launched");

        let children = Arc::clone(&self.children);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut record = record;
            let event = match child.wait().await {
                Ok(status) => {
                    record.exit_code = status.code();
                    record.signal = exit_signal_name(status);
                    record.exited_at = Some(Utc::now());
                    lock(&children).remove(&pid);
                    info!(pid, exit_code = ?record.exit_code, signal = ?record.signal, "supervised process exited");
                    SupervisorEvent::Exited(record)
                }
                Err(err) => {
                    let error = err.to_string();
                    record.error = Some(error.clone());
                    lock(&children).remove(&pid);
                    warn!(pid, %err, "error waiting for supervised process");
                    SupervisorEvent::Failed { record, error }
                }
            };
            // No receivers is fine; nobody asked to be told.
            let _ = events.send(event);
        });

        Ok(pid)
    }

    /// Send `signal` to `pid`.
    ///
    /// Returns `Ok(false)` when no such process exists. There is no
    /// escalation: callers wanting a forced kill follow up themselves.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Signal` for any other delivery failure.
    pub fn stop(&self, pid: u32, signal: StopSignal) -> Result<bool> {
        signal_pid(pid, signal)
    }

    /// Probe whether `pid` exists.
    ///
    /// A permission-denied probe counts as alive: the process exists even
    /// though this caller may not control it.
    #[must_use]
    pub fn is_alive(&self, pid: u32) -> bool {
        is_alive(pid)
    }

    /// Snapshot of a live tracked child.
    #[must_use]
    pub fn get(&self, pid: u32) -> Option<ProcessRecord> {
        self.table().get(&pid).cloned()
    }

    /// Snapshot of every live tracked child.
    #[must_use]
    pub fn list(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> = self.table().values().cloned().collect();
        records.sort_by_key(|record| record.launched_at);
        records
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u32, ProcessRecord>> {
        lock(&self.children)
    }
}

fn lock(children: &Mutex<HashMap<u32, ProcessRecord>>) -> MutexGuard<'_, HashMap<u32, ProcessRecord>> {
    children.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deliver `signal` to `pid`; `Ok(false)` when no such process exists.
///
/// # Errors
///
/// Returns `AppError::Signal` for any other delivery failure.
#[cfg(unix)]
pub fn signal_pid(pid: u32, signal: StopSignal) -> Result<bool> {
    use nix::errno::Errno;

    let Some(target) = to_nix_pid(pid) else {
        return Ok(false);
    };
    match nix::sys::signal::kill(target, Some(signal.into())) {
        Ok(()) => {
            info!(pid, ?signal, "signal delivered");
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(AppError::Signal(format!(
            "failed to signal pid {pid}: {err}"
        ))),
    }
}

/// Deliver `signal` to `pid`.
///
/// # Errors
///
/// Always returns `AppError::Signal`: signal delivery needs a Unix host.
#[cfg(not(unix))]
pub fn signal_pid(pid: u32, _signal: StopSignal) -> Result<bool> {
    Err(AppError::Signal(format!(
        "cannot signal pid {pid}: unsupported platform"
    )))
}

/// Probe whether `pid` exists with a zero-effect signal.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;

    let Some(target) = to_nix_pid(pid) else {
        return false;
    };
    matches!(nix::sys::signal::kill(target, None), Ok(()) | Err(Errno::EPERM))
}

/// Probe whether `pid` exists. Always `false` off Unix.
#[cfg(not(unix))]
#[must_use]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Pid 0 and values outside `i32` would address process groups; reject them.
#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|&raw| raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Name of the signal that terminated a process, e.g. `SIGTERM`.
#[must_use]
pub fn exit_signal_name(status: ExitStatus) -> Option<String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        status.signal().map(|raw| {
            nix::sys::signal::Signal::try_from(raw)
                .map_or_else(|_| format!("signal {raw}"), |sig| sig.as_str().to_owned())
        })
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}
