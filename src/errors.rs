//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// A process could not be launched: background execution disabled,
    /// missing launch target, or the spawn produced no pid.
    Launch(String),
    /// Delivering a signal failed for a reason other than "no such process".
    Signal(String),
    /// Session store could not be written.
    Store(String),
    /// An executor produced an unusable command descriptor.
    Executor(String),
    /// Live stream connection failure or reconnect exhaustion.
    Stream(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Signal(msg) => write!(f, "signal: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::Executor(msg) => write!(f, "executor: {msg}"),
            Self::Stream(msg) => write!(f, "stream: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
