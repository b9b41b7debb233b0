//! Application configuration
//!
//! Loaded from TOML. Every section has defaults so a partial file (or no
//! file at all) is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::control::{ControlParameters, RateBounds};
use crate::error::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "PLAYSYNC_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub sync: SyncConfig,
    pub control: ControlParameters,
    pub playback: PlaybackConfig,
    pub ui: UiConfig,
}

/// Relay, heartbeat and reconnection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Relay address clients dial
    pub relay_address: String,
    /// Address the relay server binds
    pub relay_bind: String,
    /// UDP port for proximity discovery
    pub discovery_port: u16,
    pub proximity_probe_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Outbound frames buffered per relay peer before the oldest is dropped
    pub peer_queue_capacity: usize,
    /// Relay drops peers silent for longer than this
    pub peer_idle_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relay_address: format!("127.0.0.1:{}", DEFAULT_RELAY_PORT),
            relay_bind: format!("0.0.0.0:{}", DEFAULT_RELAY_PORT),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            proximity_probe_timeout_ms: 500,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            peer_queue_capacity: DEFAULT_PEER_QUEUE_CAPACITY,
            peer_idle_timeout_ms: 3 * DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

impl NetworkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub room: String,
    /// Caller identifier sent with `auth`; generated when absent
    pub client_address: Option<String>,
    /// Base scheduler tick; leaders broadcast once per tick
    pub broadcast_interval_ms: u64,
    pub sample_interval_ms: u64,
    pub target_free_energy: f64,
    /// Leaders forget node reports older than this
    pub node_report_ttl_ms: u64,
    pub initial_track: Option<u64>,
    pub enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            room: DEFAULT_ROOM.to_string(),
            client_address: None,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            target_free_energy: DEFAULT_TARGET_FREE_ENERGY,
            node_report_ttl_ms: DEFAULT_NODE_REPORT_TTL_MS,
            initial_track: None,
            enabled: true,
        }
    }
}

/// Bounds applied to the playback engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub rate_bounds: RateBounds,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            rate_bounds: RateBounds::DEFAULT,
        }
    }
}

/// Status API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl AppConfig {
    /// Load from `PLAYSYNC_CONFIG`, then the platform config dir, else defaults
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// `<config dir>/playsync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "playsync").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        let bounds = self.playback.rate_bounds;
        if !bounds.is_valid() {
            return Err(Error::Config(format!(
                "playback rate bounds {}..={} must be positive and ordered",
                bounds.min, bounds.max
            )));
        }
        if !bounds.contains(1.0) {
            return Err(Error::Config("playback rate bounds must include 1.0".into()));
        }

        let net = &self.network;
        if net.heartbeat_interval_ms == 0 || net.heartbeat_timeout_ms == 0 {
            return Err(Error::Config("heartbeat intervals must be non-zero".into()));
        }
        if net.heartbeat_timeout_ms <= net.heartbeat_interval_ms {
            return Err(Error::Config(
                "heartbeat timeout must exceed the heartbeat interval".into(),
            ));
        }
        if net.reconnect_base_ms == 0 || net.reconnect_max_delay_ms < net.reconnect_base_ms {
            return Err(Error::Config("invalid reconnection delays".into()));
        }
        if net.peer_queue_capacity == 0 {
            return Err(Error::Config("peer queue capacity must be non-zero".into()));
        }

        if self.sync.broadcast_interval_ms == 0 || self.sync.sample_interval_ms == 0 {
            return Err(Error::Config("sync intervals must be non-zero".into()));
        }
        if self.sync.room.is_empty() {
            return Err(Error::Config("room name must not be empty".into()));
        }
        Ok(())
    }
}
