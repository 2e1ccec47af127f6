//! Execution coordinator.
//!
//! Drives one agent invocation: spawns the executor's command, tees its
//! output into the run's log (and the terminal for foreground runs), watches
//! stdout for the executor's session marker, and moves the session entry
//! through `starting → running → completed | failed | stopped`.
//!
//! A single task owns the child, the log sink and the run's session entry.
//! It finishes exactly once, so the [`RunHandle`] settles at most once
//! whichever of exit, interruption or runtime error happens first. The
//! child's exit is authoritative: output still held open by its descendants
//! is only drained for a short grace period afterwards.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::supervisor::exit_signal_name;
use crate::executor::{CommandDescriptor, ExecutorHandle, ExtractionContext, OutputFilter};
use crate::models::session::{SessionDocument, SessionEntry, SessionStatus};
use crate::persistence::session_store::SessionStore;
use crate::{AppError, Result};

/// Event type announcing the executor's own session identifier.
const SESSION_MARKER_TYPE: &str = "session.created";

/// Buffered output lines between the pipe readers and the run task.
const OUTPUT_CAPACITY: usize = 256;

/// How long output is still collected once the executor has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How long an interrupted executor may take to exit before it is killed.
const INTERRUPT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Everything `execute_run` needs besides the executor and the store.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Agent being invoked.
    pub agent_name: String,
    /// Immutable key of the session entry in the document.
    pub session_key: String,
    /// Command produced by the executor.
    pub command: CommandDescriptor,
    /// Log sink for this run.
    pub log_path: PathBuf,
    /// Background runs never touch the terminal.
    pub background: bool,
    /// Pid of the background runner driving this run, if any.
    pub runner_pid: Option<u32>,
    /// Logical start time of the run.
    pub start_time: DateTime<Utc>,
    /// Delay before the one-shot session id check, unless the executor overrides it.
    pub default_extraction_delay: Duration,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Agent that ran.
    pub agent_name: String,
    /// Session key.
    pub session_key: String,
    /// Session entry as last persisted.
    pub entry: SessionEntry,
    /// Wall-clock time since the logical start.
    pub elapsed: Duration,
}

impl RunOutcome {
    /// Whether the run completed successfully.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.entry.status == SessionStatus::Completed
    }
}

/// Completion handle of a run.
#[derive(Debug)]
pub struct RunHandle {
    pid: Option<u32>,
    interrupt: CancellationToken,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Pid of the executor child; `None` when the spawn failed.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Token that stops the run when cancelled.
    ///
    /// The executor is sent `SIGTERM`, killed if it is still alive after a
    /// grace period, and the session is recorded as `stopped`.
    #[must_use]
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Stop the run; shorthand for cancelling [`RunHandle::interrupt_token`].
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Wait until the run has been finalized and persisted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Executor` if the run task panicked or was aborted.
    pub async fn wait(self) -> Result<RunOutcome> {
        self.task
            .await
            .map_err(|err| AppError::Executor(format!("run task did not finish: {err}")))
    }
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Start a run and return its completion handle.
///
/// Only the entry under `spec.session_key` is taken from `document`; it is
/// created if missing. Every write reloads the store and replaces just that
/// entry, so sessions recorded by other processes meanwhile survive. Before
/// any output is read, the entry is persisted as `running` with the
/// executor pid attached.
///
/// # Errors
///
/// Returns `AppError::Executor` for an invalid command descriptor and
/// `AppError::Io` if the log directory or file cannot be opened. A child
/// that fails to spawn is not an error: the handle resolves with a `failed`
/// entry.
pub async fn execute_run(
    spec: RunSpec,
    executor: Arc<dyn ExecutorHandle>,
    store: SessionStore,
    mut document: SessionDocument,
) -> Result<RunHandle> {
    spec.command.validate(executor.name())?;

    let span = info_span!("run", agent = %spec.agent_name, session = %spec.session_key);
    let log = open_log(&spec).instrument(span.clone()).await?;

    let mut entry = document
        .sessions
        .remove(&spec.session_key)
        .unwrap_or_else(|| SessionEntry::new(&spec.agent_name, &spec.session_key, spec.start_time));
    let interrupt = CancellationToken::new();

    let mut child = match build_command(&spec.command).spawn() {
        Ok(child) => child,
        Err(err) => {
            span.in_scope(|| warn!(program = %spec.command.program, %err, "executor failed to start"));
            entry.status = SessionStatus::Failed;
            entry.error = Some(err.to_string());
            entry.touch();
            persist(&store, &spec.session_key, &entry);
            let outcome = finish(&spec, entry);
            drop(log);
            if !spec.background {
                eprintln!("{}", render_summary(&outcome));
            }
            let task = tokio::spawn(async move { outcome });
            return Ok(RunHandle {
                pid: None,
                interrupt,
                task,
            });
        }
    };

    let pid = child.id();
    entry.status = SessionStatus::Running;
    entry.executor_pid = pid;
    if spec.runner_pid.is_some() {
        entry.runner_pid = spec.runner_pid;
    }
    entry.log_file = Some(spec.log_path.clone());
    entry.background = Some(spec.background);
    entry.touch();
    persist(&store, &spec.session_key, &entry);
    span.in_scope(|| info!(pid, "executor running"));

    let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone(), OutputLine::Stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx, OutputLine::Stderr);
    }

    let run = RunTask {
        spec,
        executor,
        store,
        entry,
        log,
        filter: None,
    };
    let task = tokio::spawn(run.drive(child, rx, interrupt.clone()).instrument(span));
    Ok(RunHandle { pid, interrupt, task })
}

struct RunTask {
    spec: RunSpec,
    executor: Arc<dyn ExecutorHandle>,
    store: SessionStore,
    entry: SessionEntry,
    log: File,
    filter: Option<Box<dyn OutputFilter>>,
}

impl RunTask {
    async fn drive(
        mut self,
        mut child: Child,
        mut rx: mpsc::Receiver<OutputLine>,
        interrupt: CancellationToken,
    ) -> RunOutcome {
        self.filter = self.executor.create_output_filter();
        let delay = self
            .executor
            .session_extraction_delay(self.spec.default_extraction_delay);
        let extraction = tokio::time::sleep(delay);
        tokio::pin!(extraction);
        let kill_timer = tokio::time::sleep(INTERRUPT_KILL_GRACE);
        tokio::pin!(kill_timer);

        let mut extraction_fired = false;
        let mut output_open = true;
        let mut interrupted = false;
        let mut killed = false;

        let waited = loop {
            tokio::select! {
                status = child.wait() => break status,
                line = rx.recv(), if output_open => match line {
                    Some(line) => self.handle_line(line).await,
                    None => output_open = false,
                },
                () = &mut extraction, if !extraction_fired => {
                    extraction_fired = true;
                    self.delayed_session_check();
                }
                () = interrupt.cancelled(), if !interrupted => {
                    interrupted = true;
                    warn!("run interrupted; terminating executor");
                    terminate(&mut child);
                    kill_timer.as_mut().reset(Instant::now() + INTERRUPT_KILL_GRACE);
                }
                () = &mut kill_timer, if interrupted && !killed => {
                    killed = true;
                    warn!("executor still running after termination; killing");
                    if let Err(err) = child.start_kill() {
                        warn!(%err, "failed to kill executor");
                    }
                }
            }
        };

        if output_open {
            self.drain_output(&mut rx).await;
        }
        drop(rx);

        let stopped_externally = self
            .store
            .load()
            .sessions
            .get(&self.spec.session_key)
            .is_some_and(|stored| stored.status == SessionStatus::Stopped);
        let stopped = interrupted || stopped_externally;

        match waited {
            Ok(status) => {
                self.entry.exit_code = status.code();
                self.entry.signal = exit_signal_name(status);
                self.entry.status = if stopped {
                    SessionStatus::Stopped
                } else if status.code() == Some(0) {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                };
                self.entry.touch();
                info!(exit_code = ?self.entry.exit_code, signal = ?self.entry.signal, status = %self.entry.status, "executor exited");
            }
            Err(err) => {
                self.entry.status = if stopped {
                    SessionStatus::Stopped
                } else {
                    SessionStatus::Failed
                };
                self.entry.error = Some(err.to_string());
                self.entry.touch();
                warn!(%err, "error waiting for executor");
            }
        }
        persist(&self.store, &self.spec.session_key, &self.entry);

        if let Err(err) = self.log.flush().await {
            warn!(%err, "failed to flush run log");
        }

        if let Some(session_id) = self.executor.read_session_id_from_log(&self.spec.log_path) {
            self.reconcile_session_id(session_id, "log");
        }

        let outcome = finish(&self.spec, self.entry);
        if !self.spec.background {
            eprintln!("{}", render_summary(&outcome));
        }
        outcome
    }

    /// Collect output that is already on its way after the executor exited.
    ///
    /// Descendants may keep the pipes open indefinitely; their output is
    /// abandoned once the grace period elapses.
    async fn drain_output(&mut self, rx: &mut mpsc::Receiver<OutputLine>) {
        let grace = tokio::time::sleep(OUTPUT_DRAIN_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => self.handle_line(line).await,
                    None => return,
                },
                () = &mut grace => {
                    debug!("executor output still held open after exit; detaching");
                    return;
                }
            }
        }
    }

    async fn handle_line(&mut self, line: OutputLine) {
        match line {
            OutputLine::Stdout(raw) => {
                let forwarded = match self.filter.as_mut() {
                    Some(filter) => filter.filter_line(&raw),
                    None => Some(raw),
                };
                if let Some(text) = forwarded {
                    self.write_log(&text).await;
                    if !self.spec.background {
                        println!("{text}");
                    }
                    if let Some(session_id) = parse_session_marker(&text) {
                        self.reconcile_session_id(session_id, "output");
                    }
                }
            }
            OutputLine::Stderr(text) => {
                self.write_log(&text).await;
                if !self.spec.background {
                    eprintln!("{text}");
                }
            }
        }
    }

    async fn write_log(&mut self, text: &str) {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        if let Err(err) = self.log.write_all(line.as_bytes()).await {
            warn!(%err, path = %self.spec.log_path.display(), "failed to write run log");
        }
    }

    fn delayed_session_check(&mut self) {
        if self.entry.session_id.is_some() {
            return;
        }
        let context = ExtractionContext {
            start_time: self.spec.start_time,
            log_path: &self.spec.log_path,
        };
        let found = self
            .executor
            .extract_session_id(&context)
            .or_else(|| self.executor.read_session_id_from_log(&self.spec.log_path));
        match found {
            Some(session_id) => self.reconcile_session_id(session_id, "delayed check"),
            None => debug!("no session id reported yet"),
        }
    }

    fn reconcile_session_id(&mut self, session_id: String, source: &str) {
        if self.entry.session_id.as_deref() == Some(session_id.as_str()) {
            return;
        }
        info!(session_id = %session_id, previous = ?self.entry.session_id, source, "executor session id recorded");
        self.entry.session_id = Some(session_id);
        self.entry.touch();
        persist(&self.store, &self.spec.session_key, &self.entry);
    }
}

/// Ask the executor to exit: `SIGTERM` where signals exist, a kill otherwise.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use super::supervisor::{signal_pid, StopSignal};

        if let Some(pid) = child.id() {
            match signal_pid(pid, StopSignal::Terminate) {
                Ok(_) => return,
                Err(err) => warn!(%err, pid, "failed to signal executor"),
            }
        }
    }
    if let Err(err) = child.start_kill() {
        warn!(%err, "failed to kill executor");
    }
}

/// Extract the executor session id from a `session.created` marker line.
///
/// Only lines that look like a JSON object are inspected; anything else,
/// including malformed JSON, yields `None`.
#[must_use]
pub fn parse_session_marker(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    if value.get("type").and_then(Value::as_str) != Some(SESSION_MARKER_TYPE) {
        return None;
    }
    value
        .get("session_id")
        .or_else(|| value.get("sessionId"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

/// Human-readable completion summary for foreground runs.
#[must_use]
pub fn render_summary(outcome: &RunOutcome) -> String {
    let entry = &outcome.entry;
    let mut text = match entry.status {
        SessionStatus::Completed => format!("✔ {} completed", outcome.agent_name),
        SessionStatus::Stopped => format!("■ {} stopped", outcome.agent_name),
        _ => format!("✖ {} failed", outcome.agent_name),
    };
    let _ = write!(text, " [session {}]", outcome.session_key);
    if let Some(code) = entry.exit_code {
        let _ = write!(text, " exit code {code}");
    }
    if let Some(signal) = &entry.signal {
        let _ = write!(text, " signal {signal}");
    }
    let _ = write!(text, " in {:.1}s", outcome.elapsed.as_secs_f64());
    if let Some(error) = &entry.error {
        let _ = write!(text, "\n  launch error: {error}");
    }
    if let Some(log) = &entry.log_file {
        let _ = write!(text, "\n  log: {}", log.display());
    }
    text
}

async fn open_log(spec: &RunSpec) -> Result<File> {
    if let Some(dir) = spec.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await.map_err(|err| {
            AppError::Io(format!("failed to create log directory {}: {err}", dir.display()))
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .await
        .map_err(|err| {
            AppError::Io(format!("failed to open log {}: {err}", spec.log_path.display()))
        })?;

    let fresh = file.metadata().await.map(|meta| meta.len() == 0).unwrap_or(false);
    if fresh {
        let header = format!(
            "# agent-relay {} :: {} :: started {}\n",
            env!("CARGO_PKG_VERSION"),
            spec.agent_name,
            spec.start_time.to_rfc3339()
        );
        file.write_all(header.as_bytes()).await?;
    }
    Ok(file)
}

fn build_command(descriptor: &CommandDescriptor) -> Command {
    let mut cmd = Command::new(&descriptor.program);
    cmd.args(&descriptor.args)
        .envs(&descriptor.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &descriptor.cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

fn spawn_reader<R>(pipe: R, tx: mpsc::Sender<OutputLine>, wrap: fn(String) -> OutputLine)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_owned();
                    if tx.send(wrap(line)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "failed to read executor output");
                    break;
                }
            }
        }
    });
}

/// Replace this run's entry in the stored document, keeping every other session.
fn persist(store: &SessionStore, key: &str, entry: &SessionEntry) {
    let mut document = store.load();
    document.sessions.insert(key.to_owned(), entry.clone());
    if let Err(err) = store.save(&document) {
        warn!(%err, "failed to persist session store");
    }
}

fn finish(spec: &RunSpec, entry: SessionEntry) -> RunOutcome {
    let elapsed = (Utc::now() - spec.start_time).to_std().unwrap_or_default();
    RunOutcome {
        agent_name: spec.agent_name.clone(),
        session_key: spec.session_key.clone(),
        entry,
        elapsed,
    }
}
