use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Minimum secret length before AES-256-CBC encryption is activated for a
/// run. Shorter secrets disable encryption (fail-open, logged as a warning).
pub const MIN_ENCRYPTION_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Connection string of the datastore handed to the dump utility.
    pub database_url: String,
    /// Optional explicit path to the dump utility; PATH lookup otherwise.
    pub pg_dump_path: Option<PathBuf>,
    /// Directory for in-flight dump/archive/encrypted files.
    pub temp_dir: PathBuf,
    /// Optional directory of file assets bundled into each archive.
    pub uploads_dir: Option<PathBuf>,
    /// Secret for artifact encryption; must be at least 32 chars to take effect.
    pub encryption_key: Option<String>,
    /// Number of remote artifacts the retention collector keeps.
    pub retention_keep: usize,
    /// Cron expression for unattended runs (seconds field included).
    pub schedule: String,
    /// Prefix for remote artifact names.
    pub remote_prefix: String,
    /// Explicit remote folder id; skips folder creation when set.
    pub drive_folder_id: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub oauth_redirect_uri: Option<String>,
    /// Where exchanged OAuth tokens are persisted between restarts.
    pub token_path: PathBuf,
    /// SQLite file holding the job ledger.
    pub ledger_path: PathBuf,
    /// Deadline applied to every pipeline stage.
    pub stage_timeout_secs: u64,
    pub slack_webhook: Option<String>,
    pub verbose: bool,
    pub json_logs: bool,
    /// Replaces the dump utility and remote store with in-process fakes.
    pub simulation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            pg_dump_path: None,
            temp_dir: PathBuf::from("./tmp/backups"),
            uploads_dir: None,
            encryption_key: None,
            retention_keep: 4,
            schedule: "0 0 3 * * SUN".to_string(),
            remote_prefix: "vaultd".to_string(),
            drive_folder_id: None,
            oauth_client_id: None,
            oauth_client_secret: None,
            oauth_redirect_uri: None,
            token_path: PathBuf::from("./vaultd-token.json"),
            ledger_path: PathBuf::from("./vaultd.db"),
            stage_timeout_secs: 3600,
            slack_webhook: None,
            verbose: false,
            json_logs: false,
            simulation: false,
        }
    }
}

impl AppConfig {
    /// Layered load: defaults, then `Vaultd.toml`, then `VAULTD_*` env vars,
    /// then CLI overrides (highest precedence).
    pub fn new<T: Serialize>(cli_overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file("Vaultd.toml"))
            .merge(Env::prefixed("VAULTD_"));

        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().context("Failed to load configuration")
    }

    /// AES-256 key derived from the configured secret, or None when the
    /// secret is absent or too short to activate encryption.
    pub fn encryption_key_bytes(&self) -> Option<[u8; 32]> {
        let secret = self.encryption_key.as_deref()?;
        if secret.len() < MIN_ENCRYPTION_KEY_LEN {
            return None;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&secret.as_bytes()[..32]);
        Some(key)
    }
}
