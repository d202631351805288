//! Configuration for the real-time stream client
//!
//! Loaded from TOML. Every section and key is optional; omitted values fall
//! back to the defaults below.

use crate::realtime::backoff::BackoffPolicy;
use crate::realtime::connection::validate_endpoint;
use crate::realtime::heartbeat::HeartbeatConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default endpoint of the risk stream backend
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/risk-stream";

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Endpoint and open watchdog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// WebSocket endpoint (`ws://` or `wss://`)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Bound on a single open attempt
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

/// Liveness probing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSection {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

/// Reconnection backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_cap_delay_ms")]
    pub cap_delay_ms: u64,
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            cap_delay_ms: default_cap_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_open_timeout_ms() -> u64 {
    10_000
}

fn default_probe_interval_ms() -> u64 {
    30_000
}

fn default_stale_after_ms() -> u64 {
    15_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_cap_delay_ms() -> u64 {
    30_000
}

fn default_jitter_fraction() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    10
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and endpoint syntax
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.client.endpoint)
            .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;

        if self.client.open_timeout_ms == 0 {
            return Err(invalid("client.open_timeout_ms must be greater than 0"));
        }
        if self.heartbeat.probe_interval_ms == 0 {
            return Err(invalid("heartbeat.probe_interval_ms must be greater than 0"));
        }
        if self.heartbeat.stale_after_ms == 0 {
            return Err(invalid("heartbeat.stale_after_ms must be greater than 0"));
        }

        self.backoff_policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            cap_delay: Duration::from_millis(self.reconnect.cap_delay_ms),
            jitter_fraction: self.reconnect.jitter_fraction,
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            probe_interval: Duration::from_millis(self.heartbeat.probe_interval_ms),
            stale_after: Duration::from_millis(self.heartbeat.stale_after_ms),
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.client.open_timeout_ms)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}
