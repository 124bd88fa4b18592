//! Session token persistence
//!
//! Keeps the access/refresh token pair between runs so `folio sync` works
//! after a single `folio login`.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tokens issued by the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
}

/// Source of the current credentials
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
}

/// Sink for tokens returned by login or refresh
pub trait TokenSaver: Send + Sync {
    fn save_tokens(&self, access_token: &str, refresh_token: Option<&str>, user_id: Option<&str>);
}

/// Session tokens, optionally persisted to a JSON file
#[derive(Debug, Default)]
pub struct SessionStore {
    tokens: Mutex<SessionTokens>,
    /// Path to persist tokens
    path: Option<PathBuf>,
}

impl SessionStore {
    /// Create an in-memory session (for testing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session that persists to disk
    pub fn with_path(path: PathBuf) -> Result<Self> {
        let store = Self {
            tokens: Mutex::new(SessionTokens::default()),
            path: Some(path.clone()),
        };

        if path.exists() {
            store.load()?;
        }

        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, SessionTokens> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tokens(&self) -> SessionTokens {
        self.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().access_token.is_some()
    }

    /// Save tokens to disk
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&*self.lock())?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, json).context("Failed to save session")?;
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let json = fs::read_to_string(path).context("Failed to read session")?;
        let tokens: SessionTokens =
            serde_json::from_str(&json).context("Failed to parse session file")?;
        *self.lock() = tokens;
        Ok(())
    }

    /// Forget the tokens and remove the session file
    pub fn clear(&self) -> Result<()> {
        *self.lock() = SessionTokens::default();

        if let Some(ref path) = self.path {
            if path.exists() {
                fs::remove_file(path).context("Failed to remove session file")?;
            }
        }
        Ok(())
    }
}

impl TokenProvider for SessionStore {
    fn access_token(&self) -> Option<String> {
        self.lock().access_token.clone()
    }

    fn refresh_token(&self) -> Option<String> {
        self.lock().refresh_token.clone()
    }
}

impl TokenSaver for SessionStore {
    fn save_tokens(&self, access_token: &str, refresh_token: Option<&str>, user_id: Option<&str>) {
        {
            let mut tokens = self.lock();
            tokens.access_token = Some(access_token.to_string());
            if let Some(refresh_token) = refresh_token {
                tokens.refresh_token = Some(refresh_token.to_string());
            }
            if let Some(user_id) = user_id {
                tokens.user_id = Some(user_id.to_string());
            }
        }

        if let Err(e) = self.save() {
            warn!("Failed to persist session tokens: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_new_is_anonymous() {
        let session = SessionStore::new();
        assert!(!session.is_authenticated());
        assert_eq!(session.refresh_token(), None);
    }

    #[test]
    fn test_session_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");

        {
            let session = SessionStore::with_path(path.clone()).unwrap();
            session.save_tokens("access-1", Some("refresh-1"), Some("user-1"));
        }

        {
            let session = SessionStore::with_path(path).unwrap();
            assert_eq!(session.access_token().as_deref(), Some("access-1"));
            assert_eq!(session.refresh_token().as_deref(), Some("refresh-1"));
            assert_eq!(session.tokens().user_id.as_deref(), Some("user-1"));
        }
    }

    #[test]
    fn test_refresh_keeps_previous_refresh_token() {
        let session = SessionStore::new();
        session.save_tokens("access-1", Some("refresh-1"), None);
        session.save_tokens("access-2", None, None);

        assert_eq!(session.access_token().as_deref(), Some("access-2"));
        assert_eq!(session.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[test]
    fn test_session_clear_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");

        let session = SessionStore::with_path(path.clone()).unwrap();
        session.save_tokens("access-1", None, None);
        assert!(path.exists());

        session.clear().unwrap();
        assert!(!session.is_authenticated());
        assert!(!path.exists());
    }
}
