//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::realtime::protocol::DEFAULT_NOTIFICATION_EVENTS;

const DEFAULT_SERVER_URL: &str = "http://localhost:5000";
const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket server base URL (http(s) or ws(s))
    pub server_url: String,
    /// REST API base URL
    pub api_url: String,
    /// User id sent as connection metadata
    pub user_id: Option<String>,
    /// Bearer token for the REST API
    pub access_token: Option<String>,
    pub handshake_timeout_secs: u64,
    /// Per-room cap on remembered message ids
    pub dedup_capacity: usize,
    /// How long an optimistic message waits for its server echo
    pub reconcile_window_secs: u64,
    pub auto_reconnect: bool,
    pub max_backoff_secs: u64,
    /// Socket event names relayed as notifications
    pub notification_events: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            user_id: None,
            access_token: None,
            handshake_timeout_secs: 20,
            dedup_capacity: 500,
            reconcile_window_secs: 10,
            auto_reconnect: true,
            max_backoff_secs: 64,
            notification_events: DEFAULT_NOTIFICATION_EVENTS
                .iter()
                .map(|n| n.to_string())
                .collect(),
        }
    }
}

/// Tunables consumed by `ChatSession`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub dedup_capacity: usize,
    pub reconcile_window: Duration,
    pub auto_reconnect: bool,
    pub max_backoff: Duration,
    pub notification_events: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Config::default().session()
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "bidchat", "bidchat")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file. Missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Restrictive permissions: file may hold an access token
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            dedup_capacity: self.dedup_capacity.max(1),
            reconcile_window: Duration::from_secs(self.reconcile_window_secs),
            auto_reconnect: self.auto_reconnect,
            max_backoff: Duration::from_secs(self.max_backoff_secs.max(1)),
            notification_events: self.notification_events.clone(),
        }
    }
}
