//! Client configuration.
//!
//! Read from `~/.config/chathub/client.toml` when present (or the file
//! named by `CHATHUB_CONFIG`), then overridden by `CHATHUB_URL` and
//! `CHATHUB_NAME`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use chathub_protocol::constants::DEFAULT_HUB_PATH;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hub endpoint URL.
    #[serde(default = "default_url")]
    pub url: String,

    /// Display name attached to outgoing messages (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Reconnect automatically after a lost connection.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

fn default_url() -> String {
    format!("ws://localhost:5000{DEFAULT_HUB_PATH}")
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "anonymous".into())
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            name: default_name(),
            auto_reconnect: true,
        }
    }
}

impl Config {
    /// Loads the config file if it exists and applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Applies `CHATHUB_URL` / `CHATHUB_NAME` from `lookup`. Blank values
    /// are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let set = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(url) = set("CHATHUB_URL") {
            self.url = url;
        }
        if let Some(name) = set("CHATHUB_NAME") {
            self.name = name;
        }
        self
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CHATHUB_CONFIG") {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("chathub").join("client.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("chathub")
            .join("client.toml")
    }
}
