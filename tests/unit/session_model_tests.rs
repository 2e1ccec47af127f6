//! Unit tests for the session entry model and lifecycle rules.

use chrono::{TimeZone, Utc};

use agent_relay::models::session::{
    generate_session_name, slugify, SessionDocument, SessionEntry, SessionStatus,
    CURRENT_VERSION, LAST_PROMPT_LIMIT,
};

#[test]
fn status_wire_names_are_kebab_case() {
    let json = serde_json::to_string(&SessionStatus::PendingCompletion).expect("serialize");
    assert_eq!(json, "\"pending-completion\"");
    let parsed: SessionStatus = serde_json::from_str("\"abandoned\"").expect("deserialize");
    assert_eq!(parsed, SessionStatus::Abandoned);
}

#[test]
fn unrecognized_status_maps_to_unknown() {
    let parsed: SessionStatus = serde_json::from_str("\"paused\"").expect("deserialize");
    assert_eq!(parsed, SessionStatus::Unknown);
}

#[test]
fn lifecycle_transitions() {
    use SessionStatus::{Abandoned, Completed, Failed, Running, Starting, Stopped};

    assert!(Starting.can_transition_to(Running));
    assert!(Starting.can_transition_to(Failed));
    assert!(Running.can_transition_to(Completed));
    assert!(Running.can_transition_to(Failed));
    assert!(Running.can_transition_to(Stopped));
    assert!(Running.can_transition_to(Abandoned));
    assert!(Starting.can_transition_to(Abandoned));

    assert!(!Completed.can_transition_to(Running));
    assert!(!Failed.can_transition_to(Stopped));
    assert!(!Running.can_transition_to(Starting));
    assert!(!Running.can_transition_to(SessionStatus::PendingCompletion));
}

#[test]
fn terminal_statuses() {
    assert!(SessionStatus::Completed.is_terminal());
    assert!(SessionStatus::Abandoned.is_terminal());
    assert!(!SessionStatus::Running.is_terminal());
    assert!(!SessionStatus::PendingCompletion.is_terminal());
}

#[test]
fn new_entry_starts_in_starting() {
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
    let entry = SessionEntry::new("analyze", "analyze-2603010930", now);
    assert_eq!(entry.status, SessionStatus::Starting);
    assert_eq!(entry.name.as_deref(), Some("analyze-2603010930"));
    assert_eq!(entry.created, Some(now));
    assert_eq!(entry.start_time, Some(now));
    assert!(entry.executor_pid.is_none());
}

#[test]
fn last_prompt_is_truncated_by_characters() {
    let mut entry = SessionEntry::default();
    let prompt = "é".repeat(LAST_PROMPT_LIMIT + 50);
    entry.set_last_prompt(&prompt);
    assert_eq!(
        entry.last_prompt.as_deref().map(|p| p.chars().count()),
        Some(LAST_PROMPT_LIMIT)
    );
}

#[test]
fn entry_serializes_camel_case_and_skips_absent_fields() {
    let mut entry = SessionEntry::default();
    entry.agent = "plan".into();
    entry.executor_pid = Some(42);
    entry.session_id = Some("ses_1".into());

    let value = serde_json::to_value(&entry).expect("serialize");
    assert_eq!(value["executorPid"], 42);
    assert_eq!(value["sessionId"], "ses_1");
    assert_eq!(value["status"], "starting");
    assert!(value.get("runnerPid").is_none());
    assert!(value.get("exitCode").is_none());
}

#[test]
fn unknown_entry_fields_survive_round_trip() {
    let raw = serde_json::json!({
        "agent": "plan",
        "status": "completed",
        "customTag": {"team": "infra"}
    });
    let entry: SessionEntry = serde_json::from_value(raw).expect("deserialize");
    assert_eq!(entry.extra.get("customTag").and_then(|v| v.get("team")), Some(&serde_json::json!("infra")));

    let back = serde_json::to_value(&entry).expect("serialize");
    assert_eq!(back["customTag"]["team"], "infra");
}

#[test]
fn default_document_is_current_version() {
    let doc = SessionDocument::default();
    assert_eq!(doc.version, CURRENT_VERSION);
    assert!(doc.sessions.is_empty());
}

#[test]
fn slugify_collapses_separators() {
    assert_eq!(slugify("Code Review!"), "code-review");
    assert_eq!(slugify("--a__b--"), "a-b");
    assert_eq!(slugify("***"), "session");
}

#[test]
fn session_name_has_minute_stamp() {
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 14, 5, 59).unwrap();
    assert_eq!(generate_session_name("Analyze", now), "analyze-2610161405");
}

#[test]
fn allocate_key_suffixes_collisions() {
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 14, 5, 0).unwrap();
    let mut doc = SessionDocument::default();
    let first = doc.allocate_key("plan", now);
    doc.sessions.insert(first.clone(), SessionEntry::new("plan", first.as_str(), now));
    let second = doc.allocate_key("plan", now);
    doc.sessions.insert(second.clone(), SessionEntry::new("plan", second.as_str(), now));
    let third = doc.allocate_key("plan", now);

    assert_eq!(first, "plan-2610161405");
    assert_eq!(second, "plan-2610161405-2");
    assert_eq!(third, "plan-2610161405-3");
}
