//! Persistent configuration
//!
//! Everything the `blink` binary can be told on the command line can also be
//! kept in a TOML file, by default `~/.blink.toml`. Durations are stored as
//! milliseconds.

use crate::broadcast::{StreamMethod, StreamerOptions};
use crate::filter::FilterConfig;
use crate::monitor::WatcherConfig;
use crate::webhook::WebhookConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the home directory
pub const CONFIG_FILE_NAME: &str = ".blink.toml";

/// Complete settings for one watch server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkConfig {
    /// Directory tree to watch
    pub path: PathBuf,
    /// Listen address; `":port"` means every interface
    pub event_addr: String,
    /// Route of the event stream
    pub event_path: String,
    pub allowed_origin: String,
    pub refresh_ms: u64,
    pub handler_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub stream_method: StreamMethod,
    /// Log every accepted event at info level
    pub show_events: bool,
    pub filter: FilterConfig,
    pub webhook: WebhookConfig,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            event_addr: ":12345".to_string(),
            event_path: "/events".to_string(),
            allowed_origin: "*".to_string(),
            refresh_ms: 100,
            handler_delay_ms: 100,
            poll_interval_ms: 4000,
            stream_method: StreamMethod::Sse,
            show_events: false,
            filter: FilterConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl BlinkConfig {
    /// Location of the per-user config file, if a home directory is known
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    /// Load `explicit` if given, else the default file if it exists, else defaults.
    ///
    /// An explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Look up a dotted key such as `webhook.url`
    pub fn get(&self, key: &str) -> Result<Option<toml::Value>> {
        let mut value = toml::Value::try_from(self).context("Failed to serialize config")?;
        for segment in key.split('.').filter(|s| !s.is_empty()) {
            match value.get(segment) {
                Some(next) => value = next.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(value))
    }

    /// Socket address to bind
    pub fn listen_address(&self) -> String {
        let addr = self.event_addr.trim();
        if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        }
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }

    pub fn handler_delay(&self) -> Duration {
        Duration::from_millis(self.handler_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            root: self.path.clone(),
            handler_delay: self.handler_delay(),
            poll_interval: self.poll_interval(),
        }
    }

    pub fn streamer_options(&self) -> StreamerOptions {
        StreamerOptions {
            path: self.event_path.clone(),
            allowed_origin: self.allowed_origin.clone(),
            refresh: self.refresh(),
        }
    }
}
