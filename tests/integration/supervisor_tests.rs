//! Integration tests for the background process supervisor.
//!
//! Spawns real `/bin/sh` children, so these only run on Unix.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;

use agent_relay::config::BackgroundConfig;
use agent_relay::orchestrator::supervisor::{
    LaunchRequest, ProcessRecord, ProcessSupervisor, StopSignal, SupervisorEvent,
};
use agent_relay::AppError;

/// Above the kernel's pid range, so never a live process.
const MISSING_PID: u32 = 2_147_483_647;

fn attached() -> ProcessSupervisor {
    ProcessSupervisor::new(BackgroundConfig {
        enabled: true,
        detach: false,
        ..BackgroundConfig::default()
    })
}

fn shell(script: &str) -> LaunchRequest {
    LaunchRequest {
        target: Some(PathBuf::from("/bin/sh")),
        launch_args: vec!["-c".into(), script.into()],
        ..LaunchRequest::default()
    }
}

async fn wait_for_exit(events: &mut broadcast::Receiver<SupervisorEvent>, pid: u32) -> ProcessRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.expect("event channel open") {
                SupervisorEvent::Exited(record) if record.pid == pid => return record,
                SupervisorEvent::Failed { record, error } if record.pid == pid => {
                    panic!("supervised process failed: {error}")
                }
                _ => {}
            }
        }
    })
    .await
    .expect("exit notification within timeout")
}

#[tokio::test]
async fn natural_exit_publishes_record_and_untracks() {
    let supervisor = attached();
    let mut events = supervisor.subscribe();

    let pid = supervisor.launch(shell("sleep 0.2; exit 0")).expect("launch succeeds");
    assert!(supervisor.is_alive(pid));
    let tracked = supervisor.get(pid).expect("tracked while running");
    assert!(!tracked.detached);
    assert!(tracked.exit_code.is_none());

    let record = wait_for_exit(&mut events, pid).await;
    assert_eq!(record.exit_code, Some(0));
    assert!(record.signal.is_none());
    assert!(record.exited_at.is_some());
    assert!(supervisor.get(pid).is_none(), "record removed after exit");
    assert!(!supervisor.is_alive(pid));
}

#[tokio::test]
async fn launched_pids_are_distinct_and_listed() {
    let supervisor = attached();
    let mut events = supervisor.subscribe();

    let first = supervisor.launch(shell("sleep 30")).expect("first launch");
    let second = supervisor.launch(shell("sleep 30")).expect("second launch");
    assert_ne!(first, second);

    let listed: Vec<u32> = supervisor.list().iter().map(|record| record.pid).collect();
    assert!(listed.contains(&first));
    assert!(listed.contains(&second));

    assert!(supervisor.stop(first, StopSignal::Terminate).expect("stop first"));
    assert!(supervisor.stop(second, StopSignal::Kill).expect("stop second"));

    let first_record = wait_for_exit(&mut events, first).await;
    assert_eq!(first_record.signal.as_deref(), Some("SIGTERM"));
    assert!(first_record.exit_code.is_none());
    let second_record = wait_for_exit(&mut events, second).await;
    assert_eq!(second_record.signal.as_deref(), Some("SIGKILL"));
    assert!(supervisor.list().is_empty());
}

#[tokio::test]
async fn stop_on_missing_process_returns_false() {
    let supervisor = attached();
    let stopped = supervisor
        .stop(MISSING_PID, StopSignal::Terminate)
        .expect("missing process is not an error");
    assert!(!stopped);
    assert!(!supervisor.is_alive(MISSING_PID));
    assert!(!supervisor.is_alive(0), "pid 0 never probes the process group");
}

#[tokio::test]
async fn disabled_background_is_a_launch_error() {
    let supervisor = ProcessSupervisor::new(BackgroundConfig {
        enabled: false,
        ..BackgroundConfig::default()
    });
    let err = supervisor.launch(shell("exit 0")).expect_err("disabled");
    assert!(matches!(err, AppError::Launch(_)));
}

#[tokio::test]
async fn missing_target_is_a_launch_error() {
    let err = attached()
        .launch(LaunchRequest::default())
        .expect_err("no target");
    assert!(matches!(err, AppError::Launch(_)));
}

#[tokio::test]
async fn unspawnable_target_is_a_launch_error() {
    let supervisor = attached();
    let request = LaunchRequest {
        target: Some(PathBuf::from("/nonexistent/agent-relay-runner")),
        ..LaunchRequest::default()
    };
    let err = supervisor.launch(request).expect_err("spawn fails");
    assert!(matches!(err, AppError::Launch(_)));
    assert!(supervisor.list().is_empty());
}

#[tokio::test]
async fn runner_markers_reach_the_child() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = temp.path().join("markers.txt");
    let supervisor = attached();
    let mut events = supervisor.subscribe();

    let start_time = chrono::Utc::now() - chrono::Duration::minutes(5);
    let mut request = shell(&format!(
        "printf '%s|%s|%s|%s|%s' \"$AGENT_RELAY_BACKGROUND_RUNNER\" \"$AGENT_RELAY_START_TIME\" \
         \"$AGENT_RELAY_LOG_FILE\" \"$AGENT_RELAY_SESSION\" \"$EXTRA_VAR\" > '{}'",
        out.display()
    ));
    request.start_time = Some(start_time);
    request.log_path = Some(PathBuf::from("/tmp/run.log"));
    request.session = Some("plan-2610161200".into());
    request.env.insert("EXTRA_VAR".into(), "extra".into());

    let pid = supervisor.launch(request).expect("launch succeeds");
    let record = wait_for_exit(&mut events, pid).await;
    assert_eq!(record.start_time, start_time);

    let written = std::fs::read_to_string(&out).expect("child wrote markers");
    assert_eq!(
        written,
        format!(
            "1|{}|/tmp/run.log|plan-2610161200|extra",
            start_time.timestamp_millis()
        )
    );
}

#[tokio::test]
async fn detached_children_are_marked() {
    let supervisor = ProcessSupervisor::new(BackgroundConfig::default());
    let mut events = supervisor.subscribe();
    let pid = supervisor.launch(shell("exit 0")).expect("launch succeeds");
    let record = wait_for_exit(&mut events, pid).await;
    assert!(record.detached);
    assert_eq!(record.exit_code, Some(0));
}
