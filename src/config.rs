//! Sync engine configuration.
//!
//! Values come from environment variables first; remote credentials missing
//! from the environment are hydrated from `local_settings` (category `sync`),
//! where onboarding persists them.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::db;
use crate::error::QueueError;

const SETTINGS_CATEGORY: &str = "sync";
const KEY_REMOTE_URL: &str = "remote_url";
const KEY_REMOTE_KEY: &str = "remote_key";

const ENV_DATA_DIR: &str = "POS_SYNC_DATA_DIR";
const ENV_REMOTE_URL: &str = "POS_SYNC_REMOTE_URL";
const ENV_REMOTE_KEY: &str = "POS_SYNC_REMOTE_KEY";
const ENV_TIMEOUT_SECS: &str = "POS_SYNC_TIMEOUT_SECS";
const ENV_COUNT_REFRESH_SECS: &str = "POS_SYNC_COUNT_REFRESH_SECS";
const ENV_BACKGROUND_TAG: &str = "POS_SYNC_BACKGROUND_TAG";
const ENV_BACKGROUND_WORKER: &str = "POS_SYNC_BACKGROUND_WORKER";

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_COUNT_REFRESH_SECS: u64 = 15;
pub const DEFAULT_BACKGROUND_SYNC_TAG: &str = "sync-mutations";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding the queue database and logs.
    pub data_dir: PathBuf,
    pub remote_url: Option<String>,
    pub remote_key: Option<String>,
    pub request_timeout_secs: u64,
    /// Pending-count indicator refresh cadence. Never triggers a drain.
    pub count_refresh_secs: u64,
    pub background_sync_tag: String,
    /// Run the background worker context. When off, every trigger falls back
    /// to a direct drain.
    pub enable_background_worker: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            remote_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            count_refresh_secs: DEFAULT_COUNT_REFRESH_SECS,
            background_sync_tag: DEFAULT_BACKGROUND_SYNC_TAG.to_string(),
            enable_background_worker: true,
        }
    }
}

/// Platform data directory for the app (`.../com.thesmall.pos/offline-sync`).
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.pos").join("offline-sync")
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    env_non_empty(key).map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no"))
}

impl SyncConfig {
    /// Defaults overlaid with `POS_SYNC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env_non_empty(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        config.remote_url = env_non_empty(ENV_REMOTE_URL);
        config.remote_key = env_non_empty(ENV_REMOTE_KEY);
        if let Some(secs) = env_non_empty(ENV_TIMEOUT_SECS).and_then(|v| v.parse().ok()) {
            config.request_timeout_secs = secs;
        }
        if let Some(secs) = env_non_empty(ENV_COUNT_REFRESH_SECS).and_then(|v| v.parse().ok()) {
            config.count_refresh_secs = secs;
        }
        if let Some(tag) = env_non_empty(ENV_BACKGROUND_TAG) {
            config.background_sync_tag = tag;
        }
        if let Some(enabled) = env_flag(ENV_BACKGROUND_WORKER) {
            config.enable_background_worker = enabled;
        }
        config
    }

    /// Fill remote credentials missing from the environment with the values
    /// persisted in `local_settings`.
    pub fn apply_local_settings(&mut self, conn: &Connection) {
        if self.remote_url.is_none() {
            self.remote_url = db::get_setting(conn, SETTINGS_CATEGORY, KEY_REMOTE_URL)
                .filter(|v| !v.trim().is_empty());
        }
        if self.remote_key.is_none() {
            self.remote_key = db::get_setting(conn, SETTINGS_CATEGORY, KEY_REMOTE_KEY)
                .filter(|v| !v.trim().is_empty());
        }
    }

    /// Persist the remote credentials so the next start finds them.
    pub fn persist_remote(&self, conn: &Connection) -> Result<(), QueueError> {
        if let Some(url) = self.remote_url.as_deref() {
            db::set_setting(conn, SETTINGS_CATEGORY, KEY_REMOTE_URL, url)?;
        }
        if let Some(key) = self.remote_key.as_deref() {
            db::set_setting(conn, SETTINGS_CATEGORY, KEY_REMOTE_KEY, key)?;
        }
        info!("Remote sync credentials persisted");
        Ok(())
    }

    pub fn is_remote_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.remote_url) && present(&self.remote_key)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn count_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.count_refresh_secs.max(1))
    }
}
