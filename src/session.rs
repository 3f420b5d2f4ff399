//! Per-session query context.
//!
//! Holds the active index pattern that requests fall back to when they do
//! not name one. A [`Session`] is owned by whoever drives queries (the
//! service, a CLI invocation) and passed explicitly; there is no global
//! "current index".
//!
//! The CLI persists the session between invocations as a small JSON file:
//!
//! ```json
//! { "current_index": "logs-app-*" }
//! ```

use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SessionState {
    #[serde(default)]
    current_index: Option<String>,
}

#[derive(Debug, Default)]
pub struct Session {
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(current_index: Option<String>) -> Self {
        Self {
            state: RwLock::new(SessionState {
                current_index: current_index.filter(|s| !s.trim().is_empty()),
            }),
        }
    }

    /// The active index pattern, if one has been selected.
    pub fn current_index(&self) -> Option<String> {
        match self.state.read() {
            Ok(state) => state.current_index.clone(),
            Err(poisoned) => poisoned.into_inner().current_index.clone(),
        }
    }

    /// Select `pattern` as the active index, returning the previous one.
    pub fn set_current_index(&self, pattern: impl Into<String>) -> Option<String> {
        let pattern = pattern.into();
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.current_index.replace(pattern)
    }

    /// Load a session from `path`, or start empty when the file is absent.
    pub fn load(path: &Path, fallback_index: Option<String>) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(fallback_index));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))?;
        let state: SessionState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file: {}", path.display()))?;
        Ok(Self::new(state.current_index.or(fallback_index)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let state = SessionState {
            current_index: self.current_index(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write session file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_returns_previous() {
        let session = Session::new(Some("logs-a-*".into()));
        assert_eq!(session.set_current_index("logs-b-*").as_deref(), Some("logs-a-*"));
        assert_eq!(session.current_index().as_deref(), Some("logs-b-*"));
    }

    #[test]
    fn test_blank_default_is_unset() {
        let session = Session::new(Some("  ".into()));
        assert!(session.current_index().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/session.json");

        let session = Session::new(None);
        session.set_current_index("logs-app-*");
        session.save(&path).unwrap();

        let loaded = Session::load(&path, Some("ignored-*".into())).unwrap();
        assert_eq!(loaded.current_index().as_deref(), Some("logs-app-*"));
    }

    #[test]
    fn test_missing_file_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Session::load(&dir.path().join("nope.json"), Some("logs-*".into())).unwrap();
        assert_eq!(loaded.current_index().as_deref(), Some("logs-*"));
    }
}
