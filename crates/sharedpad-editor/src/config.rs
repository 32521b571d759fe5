//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sharedpad_core::address::DEFAULT_SESSION_LABEL;
use sharedpad_core::shared_buffer::default_dir;

use crate::session::SessionSettings;

/// Default URL of the message bus broker.
pub const DEFAULT_BUS_URL: &str = "ws://127.0.0.1:7878";

/// Main configuration for an editor instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Session label to join
    #[serde(default = "default_session")]
    pub session: String,

    /// WebSocket URL of the bus broker
    #[serde(default = "default_bus_url")]
    pub bus_url: String,

    /// Directory holding the shared bootstrap segment
    /// If not set, /dev/shm is used when present, otherwise the temp dir
    #[serde(default)]
    pub shm_dir: Option<PathBuf>,

    /// Seconds between full-document resyncs (0 disables them)
    #[serde(default)]
    pub resync_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: default_session(),
            bus_url: default_bus_url(),
            shm_dir: None,
            resync_secs: 0,
        }
    }
}

fn default_session() -> String {
    DEFAULT_SESSION_LABEL.to_string()
}

fn default_bus_url() -> String {
    DEFAULT_BUS_URL.to_string()
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Settings for one session run.
    pub fn session_settings(&self, isolated: bool) -> SessionSettings {
        SessionSettings {
            label: self.session.clone(),
            isolated,
            shm_dir: self.shm_dir.clone().unwrap_or_else(default_dir),
            resync_interval: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
        }
    }
}
