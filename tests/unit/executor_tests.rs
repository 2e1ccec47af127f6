//! Unit tests for the configured command executor and session markers.

use std::time::Duration;

use agent_relay::config::ExecutorConfig;
use agent_relay::executor::{
    CommandDescriptor, CommandExecutor, ExecutorHandle, ResumeRequest, RunRequest,
};
use agent_relay::orchestrator::coordinator::parse_session_marker;
use agent_relay::AppError;

fn executor() -> CommandExecutor {
    CommandExecutor::new(
        "opencode",
        ExecutorConfig {
            command: "opencode".into(),
            args: vec!["run".into(), "--print-logs".into()],
            resume_args: vec!["run".into(), "--session".into()],
            env: std::iter::once(("NO_COLOR".to_owned(), "1".to_owned())).collect(),
            session_extraction_delay_ms: None,
        },
    )
}

#[test]
fn run_command_appends_prompt() {
    let descriptor = executor().build_run_command(&RunRequest {
        instructions: None,
        prompt: "summarize the repo",
    });
    assert_eq!(descriptor.program, "opencode");
    assert_eq!(descriptor.args, vec!["run", "--print-logs", "summarize the repo"]);
    assert_eq!(descriptor.env.get("NO_COLOR").map(String::as_str), Some("1"));
}

#[test]
fn run_command_prepends_instructions() {
    let descriptor = executor().build_run_command(&RunRequest {
        instructions: Some("You are a reviewer.\n"),
        prompt: "review main.rs",
    });
    assert_eq!(
        descriptor.args.last().map(String::as_str),
        Some("You are a reviewer.\n\nreview main.rs")
    );
}

#[test]
fn resume_command_passes_session_id() {
    let descriptor = executor().build_resume_command(&ResumeRequest {
        session_id: "ses_9",
        prompt: "continue",
    });
    assert_eq!(descriptor.args, vec!["run", "--session", "ses_9", "continue"]);
}

#[test]
fn extraction_delay_override() {
    let default = Duration::from_secs(5);
    assert_eq!(executor().session_extraction_delay(default), default);

    let mut config = ExecutorConfig {
        command: "slow".into(),
        args: Vec::new(),
        resume_args: Vec::new(),
        env: std::collections::HashMap::new(),
        session_extraction_delay_ms: Some(20_000),
    };
    let slow = CommandExecutor::new("slow", config.clone());
    assert_eq!(slow.session_extraction_delay(default), Duration::from_secs(20));

    config.session_extraction_delay_ms = None;
    assert_eq!(CommandExecutor::new("slow", config).session_extraction_delay(default), default);
}

#[test]
fn empty_program_is_rejected() {
    let descriptor = CommandDescriptor::new("", ["x"]);
    let err = descriptor.validate("broken").expect_err("empty program");
    assert!(matches!(err, AppError::Executor(_)));
    assert!(err.to_string().contains("broken"));
    assert!(CommandDescriptor::new("sh", ["-c", "true"]).validate("sh").is_ok());
}

#[test]
fn parses_session_marker_variants() {
    assert_eq!(
        parse_session_marker(r#"{"type":"session.created","session_id":"ses_1"}"#),
        Some("ses_1".into())
    );
    assert_eq!(
        parse_session_marker(r#"  {"type":"session.created","sessionId":"ses_2"}  "#),
        Some("ses_2".into())
    );
}

#[test]
fn ignores_non_marker_lines() {
    assert_eq!(parse_session_marker("session.created ses_1"), None);
    assert_eq!(parse_session_marker(r#"{"type":"message","session_id":"ses_1"}"#), None);
    assert_eq!(parse_session_marker(r#"{"type":"session.created"}"#), None);
    assert_eq!(parse_session_marker(r#"{"type":"session.created","session_id":""}"#), None);
    assert_eq!(parse_session_marker("{ broken"), None);
}

#[test]
fn reads_last_marker_from_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("run.log");
    std::fs::write(
        &log,
        "# header\n{\"type\":\"session.created\",\"session_id\":\"first\"}\nnoise\n{\"type\":\"session.created\",\"sessionId\":\"second\"}\n",
    )
    .expect("write log");

    assert_eq!(executor().read_session_id_from_log(&log), Some("second".into()));
    assert_eq!(executor().read_session_id_from_log(&temp.path().join("absent.log")), None);
}
