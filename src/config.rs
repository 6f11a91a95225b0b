//! Configuration for gamelink

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LinkError, Result};
use crate::session::SessionConfig;

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gamelink")
        .join("config.toml")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Game server WebSocket URL
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Human-readable server name, used in logs
    #[serde(default = "default_friendly_server_name")]
    pub friendly_server_name: String,

    /// WebSocket subprotocol to request (none by default)
    #[serde(default)]
    pub subprotocol: Option<String>,

    /// User-Agent sent with the upgrade request. Some hosts refuse upgrades without one.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Seconds between latency probes
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds between queue flush attempts (also drives reconnection)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Buffered events per subscriber before the slowest one lags
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_server_url() -> String {
    "ws://localhost:8080".to_string()
}

fn default_friendly_server_name() -> String {
    "game server".to_string()
}

fn default_user_agent() -> String {
    format!("gamelink/{}", env!("CARGO_PKG_VERSION"))
}

fn default_ping_interval() -> u64 {
    5
}

fn default_flush_interval() -> u64 {
    1
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            friendly_server_name: default_friendly_server_name(),
            subprotocol: None,
            user_agent: default_user_agent(),
            ping_interval_secs: default_ping_interval(),
            flush_interval_secs: default_flush_interval(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LinkError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LinkError::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the driver cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = self.server_url.trim();
        if url.is_empty() {
            return Err(LinkError::Config("server_url is empty".into()));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(LinkError::Config(format!(
                "server_url must be a ws:// or wss:// URL, got {url}"
            )));
        }
        if self.ping_interval_secs == 0 {
            return Err(LinkError::Config("ping_interval_secs must be > 0".into()));
        }
        if self.flush_interval_secs == 0 {
            return Err(LinkError::Config("flush_interval_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// The subset of settings the session state machine needs.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server_url: self.server_url.clone(),
            subprotocol: self.subprotocol.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}
