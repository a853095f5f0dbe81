//! Server configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/chathub/server.toml`
//! - Windows: `%APPDATA%/chathub/server.toml`
//!
//! `CHATHUB_CONFIG` overrides the path.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chathub_hub_server::{ChatHubConfig, ServerConfig};
use chathub_protocol::constants::DEFAULT_HUB_PATH;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// HTTP path of the hub endpoint.
    #[serde(default = "default_path")]
    pub path: String,

    /// Idle seconds before a keep-alive ping.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_interval_secs: u64,

    /// Seconds of client silence before a session is dropped.
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,

    /// Milliseconds between two `CountDown` items.
    #[serde(default = "default_countdown_interval")]
    pub countdown_interval_ms: u64,

    /// Largest accepted `CountDown` start value.
    #[serde(default = "default_max_countdown")]
    pub max_countdown: i64,
}

fn default_bind() -> SocketAddr {
    ([0, 0, 0, 0], 5000).into()
}

fn default_path() -> String {
    DEFAULT_HUB_PATH.into()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_client_timeout() -> u64 {
    30
}

fn default_countdown_interval() -> u64 {
    2000
}

fn default_max_countdown() -> i64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: default_path(),
            keep_alive_interval_secs: default_keep_alive(),
            client_timeout_secs: default_client_timeout(),
            countdown_interval_ms: default_countdown_interval(),
            max_countdown: default_max_countdown(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or writes a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        if !config.path.starts_with('/') {
            anyhow::bail!("hub path must start with '/': {}", config.path);
        }
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            path: self.path.clone(),
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval_secs),
            client_timeout: Duration::from_secs(self.client_timeout_secs),
        }
    }

    pub fn hub_config(&self) -> ChatHubConfig {
        ChatHubConfig {
            countdown_interval: Duration::from_millis(self.countdown_interval_ms),
            max_countdown: self.max_countdown,
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CHATHUB_CONFIG") {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("chathub").join("server.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("chathub")
            .join("server.toml")
    }
}
