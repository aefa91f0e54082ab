//! Sync configuration.
//!
//! Loaded from `~/.config/tillsync/config.toml` when present, with
//! environment-variable overrides so a terminal can be provisioned
//! without writing files:
//!
//! - `TILLSYNC_REMOTE_URL`: PostgREST project URL
//! - `TILLSYNC_API_KEY`: service/API key
//! - `TILLSYNC_DB_PATH`: path to the local SQLite database
//!
//! Missing credentials are not an error at load time: the engine treats
//! an unconfigured remote as the "sync disabled" state and reports it
//! through the cycle outcome instead of failing at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default interval for `tillsync watch`.
pub const DEFAULT_WATCH_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// PostgREST project URL (e.g. https://xxxx.supabase.co).
    #[serde(default)]
    pub remote_url: Option<String>,
    /// API key sent as `apikey` + bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Path to the local SQLite database.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Seconds between cycles in watch mode.
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
}

fn default_watch_interval() -> u64 {
    DEFAULT_WATCH_INTERVAL_SECS
}

impl SyncConfig {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self {
                watch_interval_secs: DEFAULT_WATCH_INTERVAL_SECS,
                ..Self::default()
            },
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse a specific TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("TILLSYNC_REMOTE_URL") {
            if !url.is_empty() {
                self.remote_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("TILLSYNC_API_KEY") {
            if !key.is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(path) = std::env::var("TILLSYNC_DB_PATH") {
            if !path.is_empty() {
                self.db_path = Some(PathBuf::from(path));
            }
        }
    }

    /// Whether the remote side is usable at all.
    pub fn is_configured(&self) -> bool {
        matches!(&self.remote_url, Some(u) if !u.is_empty())
            && matches!(&self.api_key, Some(k) if !k.is_empty())
    }

    /// Resolved database path (defaults next to the config dir).
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        directories::ProjectDirs::from("", "", "tillsync")
            .map(|dirs| dirs.data_dir().join("till.db"))
            .unwrap_or_else(|| PathBuf::from("till.db"))
    }

    fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tillsync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

// ── Tests ───────────────────────────────────────────────────────
