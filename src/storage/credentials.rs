use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// OAuth2 credentials persisted between process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    /// Treat tokens within a minute of expiry as expired so an upload that
    /// starts now does not lose its token mid-flight.
    pub fn is_expired(&self) -> bool {
        self.expires_at - chrono::Duration::seconds(60) <= Utc::now()
    }
}

/// Token persistence boundary; file-backed in production, in-memory in
/// tests.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<TokenSet>>;
    fn store(&self, tokens: &TokenSet) -> Result<()>;
}

/// Stores the token set as JSON at a configured path.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialStore for FileTokenStore {
    fn load(&self) -> Result<Option<TokenSet>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let tokens = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(tokens))
    }

    fn store(&self, tokens: &TokenSet) -> Result<()> {
        let content = serde_json::to_string_pretty(tokens)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_token_set() {
        let temp = tempdir().unwrap();
        let store = FileTokenStore::new(temp.path().join("token.json"));

        assert!(store.load().unwrap().is_none());

        let tokens = TokenSet {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        store.store(&tokens).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, "at");
        assert_eq!(loaded.refresh_token.as_deref(), Some("rt"));
        assert!(!loaded.is_expired());
    }

    #[test]
    fn near_expiry_counts_as_expired() {
        let tokens = TokenSet {
            access_token: "at".to_string(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        };
        assert!(tokens.is_expired());
    }
}
