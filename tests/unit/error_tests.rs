//! Unit tests for `AppError` display format and conversions.

use agent_relay::AppError;

#[test]
fn display_prefixes_kind() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Launch("bad".into()), "launch: bad"),
        (AppError::Signal("bad".into()), "signal: bad"),
        (AppError::Store("bad".into()), "store: bad"),
        (AppError::Executor("bad".into()), "executor: bad"),
        (AppError::Stream("bad".into()), "stream: bad"),
        (AppError::NotFound("bad".into()), "not found: bad"),
        (AppError::Io("bad".into()), "io: bad"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn reconnect_exhaustion_message_has_no_trailing_period() {
    let err = AppError::Stream("failed to reconnect after 3 attempts".into());
    let s = err.to_string();
    assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
}

#[test]
fn json_errors_become_store_errors() {
    let parse = serde_json::from_str::<serde_json::Value>("{").expect_err("truncated json");
    let err = AppError::from(parse);
    assert!(matches!(err, AppError::Store(_)));
    assert!(err.to_string().starts_with("store: json:"));
}

#[test]
fn io_errors_become_io_errors() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err = AppError::from(io);
    assert_eq!(err.to_string(), "io: gone");
}

#[test]
fn implements_std_error() {
    fn assert_error<E: std::error::Error>(_: &E) {}
    let err = AppError::Launch("missing target".into());
    assert_error(&err);
    assert!(format!("{err:?}").contains("Launch"));
}
