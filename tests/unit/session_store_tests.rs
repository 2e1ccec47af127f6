//! Unit tests for the JSON session store.

use chrono::Utc;
use serde_json::json;

use agent_relay::models::session::{SessionDocument, SessionEntry, SessionStatus, CURRENT_VERSION};
use agent_relay::persistence::session_store::{SessionStore, StoredShape};

fn store_in(dir: &tempfile::TempDir) -> SessionStore {
    SessionStore::new(dir.path().join("state").join("sessions.json"), "opencode")
}

fn load_collecting(store: &SessionStore) -> (SessionDocument, Vec<String>) {
    let mut warnings = Vec::new();
    let doc = store.load_with(|message| warnings.push(message.to_owned()));
    (doc, warnings)
}

#[test]
fn missing_file_yields_empty_current_document() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (doc, warnings) = load_collecting(&store_in(&temp));
    assert_eq!(doc.version, CURRENT_VERSION);
    assert!(doc.sessions.is_empty());
    assert!(warnings.is_empty());
}

#[test]
fn legacy_document_is_reset_with_one_warning() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp);
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(
        store.path(),
        r#"{"version":1,"agents":{"a":{"sessionId":"x"}}}"#,
    )
    .unwrap();

    let (doc, warnings) = load_collecting(&store);
    assert_eq!(doc.version, CURRENT_VERSION);
    assert!(doc.sessions.is_empty());
    assert_eq!(warnings.len(), 1, "warnings: {warnings:?}");
    assert!(warnings[0].contains("version 1"), "warning: {}", warnings[0]);
    assert!(warnings[0].contains("start fresh sessions"));
}

#[test]
fn unversioned_document_is_incompatible() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp);
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(store.path(), r#"{"sessions":{"a":{"agent":"a"}}}"#).unwrap();

    let (doc, warnings) = load_collecting(&store);
    assert!(doc.sessions.is_empty());
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("unversioned"));
}

#[test]
fn corrupt_json_warns_and_continues_empty() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp);
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    std::fs::write(store.path(), "{ not json").unwrap();

    let (doc, warnings) = load_collecting(&store);
    assert!(doc.sessions.is_empty());
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("could not parse JSON"));
}

#[test]
fn blank_file_and_empty_object_are_silent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp);
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();

    for content in ["", "   \n", "{}"] {
        std::fs::write(store.path(), content).unwrap();
        let (doc, warnings) = load_collecting(&store);
        assert!(doc.sessions.is_empty());
        assert!(warnings.is_empty(), "content {content:?} warned: {warnings:?}");
    }
}

#[test]
fn unreadable_entry_is_dropped_with_warning() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp);
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    let raw = json!({
        "version": 3,
        "sessions": {
            "good": {"agent": "plan", "status": "completed", "executor": "claude"},
            "bad": {"agent": "plan", "executorPid": "not-a-number"}
        }
    });
    std::fs::write(store.path(), raw.to_string()).unwrap();

    let (doc, warnings) = load_collecting(&store);
    assert_eq!(doc.sessions.len(), 1);
    assert!(doc.sessions.contains_key("good"));
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("bad"));
}

#[test]
fn executor_defaults_and_alias_cross_fill() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp).with_executors(["custom"]);
    std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    let raw = json!({
        "version": 3,
        "sessions": {
            "none": {"agent": "a", "preset": "careful"},
            "unknown": {"agent": "a", "executor": "mystery", "mode": "fast"},
            "builtin": {"agent": "a", "executor": "codex"},
            "configured": {"agent": "a", "executor": "custom"}
        }
    });
    std::fs::write(store.path(), raw.to_string()).unwrap();

    let (doc, _) = load_collecting(&store);
    let get = |key: &str| doc.sessions.get(key).expect("entry present");

    assert_eq!(get("none").executor.as_deref(), Some("opencode"));
    assert_eq!(get("none").mode.as_deref(), Some("careful"));
    assert_eq!(get("unknown").executor.as_deref(), Some("opencode"));
    assert_eq!(get("unknown").preset.as_deref(), Some("fast"));
    assert_eq!(get("builtin").executor.as_deref(), Some("codex"));
    assert_eq!(get("configured").executor.as_deref(), Some("custom"));
}

#[test]
fn save_then_load_round_trips_sessions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store_in(&temp);

    let now = Utc::now();
    let mut entry = SessionEntry::new("review", "review-2610161200", now);
    entry.executor = Some("claude".into());
    entry.status = SessionStatus::Failed;
    entry.executor_pid = Some(4242);
    entry.exit_code = Some(2);
    entry.session_id = Some("ses_abc".into());
    entry.log_file = Some(temp.path().join("review.log"));

    let mut doc = SessionDocument::default();
    doc.sessions.insert("review-2610161200".into(), entry);
    store.save(&doc).expect("save creates parent directories");

    let (loaded, warnings) = load_collecting(&store);
    assert!(warnings.is_empty());
    assert_eq!(loaded.version, CURRENT_VERSION);
    assert_eq!(loaded.sessions, doc.sessions);
}

#[test]
fn classify_recognizes_shapes() {
    assert_eq!(StoredShape::classify(json!({})), StoredShape::Empty);
    assert_eq!(
        StoredShape::classify(json!([1, 2])),
        StoredShape::Incompatible { found: None }
    );
    assert_eq!(
        StoredShape::classify(json!({"version": 2, "sessions": {}})),
        StoredShape::Incompatible { found: Some(2) }
    );
    assert!(matches!(
        StoredShape::classify(json!({"version": 3, "sessions": {"a": {}}})),
        StoredShape::Current { sessions } if sessions.contains_key("a")
    ));
}
