//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MBOXSYNC_CONFIG` (environment variable)
//! 2. `~/.config/mboxsync/config.toml` (Linux/macOS)
//!    `%APPDATA%\mboxsync\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! Archive credentials may additionally be overridden with
//! `MBOXSYNC_ARCHIVE_USERNAME` and `MBOXSYNC_ARCHIVE_PASSWORD`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Remote archive location and credentials.
    pub archive: ArchiveConfig,
    /// Ingestion run tuning.
    pub sync: SyncConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding downloaded archives and the log file.
    pub data_dir: Option<PathBuf>,
    /// Override the SQLite database location (default: `<data_dir>/mboxsync.db`).
    pub database_path: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Remote archive location and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Base URL under which monthly archives live.
    pub base_url: String,
    /// List name; archive files are named `<list_name>.<YYYYMM>`.
    pub list_name: String,
    /// HTTP basic auth user (empty disables auth).
    pub username: String,
    /// HTTP basic auth password (empty disables auth).
    pub password: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
}

/// Whether an already-downloaded archive unit is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Skip the download when the local artifact already exists.
    Reuse,
    /// Always download a fresh copy.
    Refetch,
}

/// Ingestion run tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of concurrent download workers.
    pub workers: usize,
    /// Reuse or refetch cached archive units.
    pub cache_policy: CachePolicy,
    /// How far back the first sync of an empty store reaches, in days.
    pub initial_lookback_days: i64,
    /// Delete each archive unit once it has been ingested.
    pub cleanup_after_ingest: bool,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_path: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.postgresql.org/list/pgsql-hackers/mbox".to_string(),
            list_name: "pgsql-hackers".to_string(),
            username: "archives".to_string(),
            password: "antispam".to_string(),
            timeout_secs: 300,
            user_agent: concat!("mboxsync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            cache_policy: CachePolicy::Refetch,
            initial_lookback_days: 365,
            cleanup_after_ingest: false,
        }
    }
}

impl ArchiveConfig {
    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Copy for printing, with the archive password masked.
    pub fn redacted(&self) -> Config {
        let mut shown = self.clone();
        if !shown.archive.password.is_empty() {
            shown.archive.password = "********".to_string();
        }
        shown
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    let mut config = read_config_file().unwrap_or_default();
    apply_env_overrides(&mut config);
    config
}

fn read_config_file() -> Option<Config> {
    let path = config_file_path()?;
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(cfg) => {
                tracing::info!(path = %path.display(), "Loaded config");
                Some(cfg)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to parse config, using defaults"
                );
                None
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to read config file, using defaults"
            );
            None
        }
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(user) = std::env::var("MBOXSYNC_ARCHIVE_USERNAME") {
        config.archive.username = user;
    }
    if let Ok(password) = std::env::var("MBOXSYNC_ARCHIVE_PASSWORD") {
        config.archive.password = password;
    }
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MBOXSYNC_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mboxsync").join("config.toml"))
}

/// Return the data directory for archives, the database and logs.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.data_dir {
        return dir.clone();
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mboxsync")
}

/// Return the SQLite database path.
pub fn database_path(config: &Config) -> PathBuf {
    if let Some(ref path) = config.general.database_path {
        return path.clone();
    }
    data_dir(config).join("mboxsync.db")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    data_dir(config).join("mboxsync.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.workers, 4);
        assert_eq!(cfg.sync.cache_policy, CachePolicy::Refetch);
        assert_eq!(cfg.sync.initial_lookback_days, 365);
        assert_eq!(cfg.archive.list_name, "pgsql-hackers");
        assert_eq!(cfg.archive.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.archive.base_url, cfg.archive.base_url);
        assert_eq!(parsed.sync.cache_policy, cfg.sync.cache_policy);
        assert_eq!(parsed.general.log_level, cfg.general.log_level);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[archive]
list_name = "pgsql-bugs"

[sync]
cache_policy = "reuse"
workers = 2
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.archive.list_name, "pgsql-bugs");
        assert_eq!(cfg.sync.cache_policy, CachePolicy::Reuse);
        assert_eq!(cfg.sync.workers, 2);
        // Other fields use defaults
        assert_eq!(cfg.archive.timeout_secs, 300);
        assert!(!cfg.sync.cleanup_after_ingest);
    }

    #[test]
    fn test_redacted_masks_password() {
        let mut cfg = Config::default();
        cfg.archive.password = "s3cret".to_string();
        let shown = toml::to_string_pretty(&cfg.redacted()).expect("serialize");
        assert!(!shown.contains("s3cret"));
        assert!(shown.contains("password = \"********\""));
        assert_eq!(cfg.archive.password, "s3cret");

        cfg.archive.password.clear();
        assert_eq!(cfg.redacted().archive.password, "");
    }

    #[test]
    fn test_database_path_follows_data_dir() {
        let mut cfg = Config::default();
        cfg.general.data_dir = Some(PathBuf::from("/tmp/mboxsync-test"));
        assert_eq!(
            database_path(&cfg),
            PathBuf::from("/tmp/mboxsync-test/mboxsync.db")
        );
        cfg.general.database_path = Some(PathBuf::from("/var/db/list.db"));
        assert_eq!(database_path(&cfg), PathBuf::from("/var/db/list.db"));
    }
}
