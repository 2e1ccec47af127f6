//! Executor driven by a `[executors.<name>]` configuration table.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use super::{CommandDescriptor, ExecutorHandle, ResumeRequest, RunRequest};
use crate::config::ExecutorConfig;
use crate::orchestrator::coordinator::parse_session_marker;

/// Executor that appends the prompt to a configured command line.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    name: String,
    config: ExecutorConfig,
}

impl CommandExecutor {
    /// Wrap the configuration of executor `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ExecutorConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn descriptor(&self, args: Vec<String>) -> CommandDescriptor {
        CommandDescriptor {
            program: self.config.command.clone(),
            args,
            env: self.config.env.clone(),
            cwd: None,
        }
    }
}

impl ExecutorHandle for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_run_command(&self, request: &RunRequest<'_>) -> CommandDescriptor {
        let prompt = match request.instructions {
            Some(instructions) if !instructions.trim().is_empty() => {
                format!("{}\n\n{}", instructions.trim_end(), request.prompt)
            }
            _ => request.prompt.to_owned(),
        };
        let mut args = self.config.args.clone();
        args.push(prompt);
        self.descriptor(args)
    }

    fn build_resume_command(&self, request: &ResumeRequest<'_>) -> CommandDescriptor {
        let mut args = self.config.resume_args.clone();
        args.push(request.session_id.to_owned());
        args.push(request.prompt.to_owned());
        self.descriptor(args)
    }

    /// Last session marker written to the log, if any.
    fn read_session_id_from_log(&self, log_path: &Path) -> Option<String> {
        let content = match fs::read_to_string(log_path) {
            Ok(content) => content,
            Err(err) => {
                debug!(path = %log_path.display(), %err, "log not readable for session id");
                return None;
            }
        };
        content.lines().filter_map(parse_session_marker).last()
    }

    fn session_extraction_delay(&self, default: Duration) -> Duration {
        self.config
            .session_extraction_delay_ms
            .map_or(default, Duration::from_millis)
    }
}
