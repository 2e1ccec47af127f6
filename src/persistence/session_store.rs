//! JSON-file session store.
//!
//! The whole document is read and rewritten on every change. Writes are
//! last-writer-wins: two processes saving the same file concurrently can
//! drop each other's updates. Loading never fails on content; corrupt or
//! incompatible documents are reported through a warning callback and
//! replaced with an empty document at [`CURRENT_VERSION`].

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::session::{SessionDocument, SessionEntry, CURRENT_VERSION};
use crate::{AppError, Result};

/// Executors recognized without any configuration.
pub const BUILTIN_EXECUTORS: &[&str] = &[
    "opencode", "claude", "codex", "copilot", "gemini", "cursor", "qwen_code", "amp",
];

/// Shapes a stored document can take once parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredShape {
    /// Nothing usable on disk: missing, blank, or an empty object.
    Empty,
    /// Document at the current schema version.
    Current {
        /// Raw entries, decoded one by one during normalization.
        sessions: Map<String, Value>,
    },
    /// Any other shape: older or newer version, no version at all, or a
    /// legacy layout such as an `agents` map.
    Incompatible {
        /// The `version` found on disk, if there was one.
        found: Option<u64>,
    },
}

impl StoredShape {
    /// Classify a parsed JSON value.
    #[must_use]
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut object) = value else {
            return Self::Incompatible { found: None };
        };
        if object.is_empty() {
            return Self::Empty;
        }

        let found = object.get("version").and_then(Value::as_u64);
        if found == Some(u64::from(CURRENT_VERSION)) {
            let sessions = match object.remove("sessions") {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            return Self::Current { sessions };
        }

        Self::Incompatible { found }
    }
}

/// Handle on the session document at a fixed path.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    default_executor: String,
    known_executors: BTreeSet<String>,
}

impl SessionStore {
    /// Create a store for `path` that assigns `default_executor` to entries
    /// without a recognized executor.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, default_executor: impl Into<String>) -> Self {
        let default_executor = default_executor.into();
        let mut known_executors: BTreeSet<String> =
            BUILTIN_EXECUTORS.iter().map(|&name| name.to_owned()).collect();
        known_executors.insert(default_executor.clone());
        Self {
            path: path.into(),
            default_executor,
            known_executors,
        }
    }

    /// Recognize additional executor names (typically the configured ones).
    #[must_use]
    pub fn with_executors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_executors.extend(names.into_iter().map(Into::into));
        self
    }

    /// Location of the session document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, logging warnings through `tracing`.
    #[must_use]
    pub fn load(&self) -> SessionDocument {
        self.load_with(|message| warn!(path = %self.path.display(), "{message}"))
    }

    /// Load the document, delivering every warning to `on_warning`.
    pub fn load_with(&self, mut on_warning: impl FnMut(&str)) -> SessionDocument {
        let shape = match self.read_shape() {
            Ok(shape) => shape,
            Err(message) => {
                on_warning(&message);
                StoredShape::Empty
            }
        };

        let mut document = self.normalize(shape, &mut on_warning);
        self.apply_defaults(&mut document);
        document
    }

    /// Serialize the whole document and overwrite the file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the parent directory cannot be created or
    /// the file cannot be written.
    pub fn save(&self, document: &SessionDocument) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Store(format!(
                    "failed to create state directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let payload = serde_json::to_string_pretty(document)?;
        fs::write(&self.path, payload).map_err(|err| {
            AppError::Store(format!("failed to write {}: {err}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), sessions = document.sessions.len(), "session store saved");
        Ok(())
    }

    fn read_shape(&self) -> std::result::Result<StoredShape, String> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(StoredShape::Empty),
            Err(err) => {
                return Err(format!(
                    "could not read {}: {err}; continuing with no sessions",
                    self.path.display()
                ))
            }
        };

        if content.trim().is_empty() {
            return Ok(StoredShape::Empty);
        }

        serde_json::from_str::<Value>(&content)
            .map(StoredShape::classify)
            .map_err(|err| {
                format!(
                    "could not parse JSON from {}: {err}; continuing with no sessions",
                    self.path.display()
                )
            })
    }

    fn normalize(&self, shape: StoredShape, on_warning: &mut impl FnMut(&str)) -> SessionDocument {
        match shape {
            StoredShape::Empty => SessionDocument::default(),
            StoredShape::Current { sessions } => {
                let mut document = SessionDocument::default();
                for (key, raw) in sessions {
                    match serde_json::from_value::<SessionEntry>(raw) {
                        Ok(entry) => {
                            document.sessions.insert(key, entry);
                        }
                        Err(err) => on_warning(&format!(
                            "dropping unreadable session entry {key} in {}: {err}",
                            self.path.display()
                        )),
                    }
                }
                document
            }
            StoredShape::Incompatible { found } => {
                let version = found.map_or_else(|| "an unversioned".to_owned(), |v| format!("version {v}"));
                on_warning(&format!(
                    "{} uses {version} session format, which is incompatible with version \
                     {CURRENT_VERSION}; previous sessions were discarded, start fresh sessions",
                    self.path.display()
                ));
                SessionDocument::default()
            }
        }
    }

    fn apply_defaults(&self, document: &mut SessionDocument) {
        for entry in document.sessions.values_mut() {
            let recognized = entry
                .executor
                .as_deref()
                .is_some_and(|name| self.known_executors.contains(name));
            if !recognized {
                entry.executor = Some(self.default_executor.clone());
            }

            if entry.mode.is_none() {
                entry.mode.clone_from(&entry.preset);
            }
            if entry.preset.is_none() {
                entry.preset.clone_from(&entry.mode);
            }
        }
    }
}
