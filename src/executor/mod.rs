//! Executor abstraction.
//!
//! An [`ExecutorHandle`] turns an agent invocation into a concrete command
//! and optionally helps the coordinator recover the executor's own session
//! identifier. The coordinator never builds executor argument lists itself.

pub mod command;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

pub use command::CommandExecutor;

/// A program to spawn, as produced by an executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Executable name or path.
    pub program: String,
    /// Ordered argument list.
    pub args: Vec<String>,
    /// Extra environment merged over the inherited one.
    pub env: HashMap<String, String>,
    /// Working directory; inherited when `None`.
    pub cwd: Option<PathBuf>,
}

impl CommandDescriptor {
    /// Construct a descriptor for `program` with `args`.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Reject descriptors that do not name an executable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Executor` naming the offending executor.
    pub fn validate(&self, executor: &str) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(AppError::Executor(format!(
                "executor {executor} returned an invalid command configuration"
            )));
        }
        Ok(())
    }
}

/// Input for a fresh run.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    /// Agent instructions, if the agent carries any.
    pub instructions: Option<&'a str>,
    /// User prompt.
    pub prompt: &'a str,
}

/// Input for continuing an executor session.
#[derive(Debug, Clone, Copy)]
pub struct ResumeRequest<'a> {
    /// Executor session identifier to continue.
    pub session_id: &'a str,
    /// Follow-up prompt.
    pub prompt: &'a str,
}

/// Context handed to [`ExecutorHandle::extract_session_id`].
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext<'a> {
    /// Logical start time of the run.
    pub start_time: DateTime<Utc>,
    /// Log sink of the run.
    pub log_path: &'a Path,
}

/// Line transform between a child's stdout and its sinks.
pub trait OutputFilter: Send {
    /// Return the text to forward for `line`, or `None` to drop it.
    fn filter_line(&mut self, line: &str) -> Option<String>;
}

/// Capabilities the coordinator consumes from an executor.
pub trait ExecutorHandle: Send + Sync {
    /// Executor name as recorded on session entries.
    fn name(&self) -> &str;

    /// Build the command for a fresh run.
    fn build_run_command(&self, request: &RunRequest<'_>) -> CommandDescriptor;

    /// Build the command continuing an existing executor session.
    fn build_resume_command(&self, request: &ResumeRequest<'_>) -> CommandDescriptor;

    /// Filter inserted before the log sink and the terminal.
    fn create_output_filter(&self) -> Option<Box<dyn OutputFilter>> {
        None
    }

    /// Recover the executor session id from a finished or running log.
    fn read_session_id_from_log(&self, _log_path: &Path) -> Option<String> {
        None
    }

    /// Recover the executor session id from executor-specific state.
    fn extract_session_id(&self, _context: &ExtractionContext<'_>) -> Option<String> {
        None
    }

    /// Delay before the one-shot session id check.
    fn session_extraction_delay(&self, default: Duration) -> Duration {
        default
    }
}
