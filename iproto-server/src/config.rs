//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via IPROTO_CONFIG)
//! 3. Environment variables

use iproto_channel::{BytePool, ChannelConfig, Handler};
use iproto_protocol::DEFAULT_MAX_BODY_LEN;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Per-connection tuning.
    pub channel: ChannelSettings,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("IPROTO_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides looked up by environment variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.network.apply_overrides(&lookup);
        self.channel.apply_overrides(&lookup);
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate()
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3301)),
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("IPROTO_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Tuning applied to every accepted connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Largest accepted packet body in bytes.
    pub max_body_len: u32,
    /// Outbound frame queue capacity.
    pub write_queue_size: usize,
    /// Call timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Graceful shutdown limit in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Reuse frame buffers.
    pub byte_pool: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            max_body_len: DEFAULT_MAX_BODY_LEN,
            write_queue_size: iproto_channel::config::DEFAULT_WRITE_QUEUE_SIZE,
            request_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            byte_pool: true,
        }
    }
}

impl ChannelSettings {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(len) = lookup("IPROTO_MAX_BODY_LEN") {
            if let Ok(n) = len.parse() {
                self.max_body_len = n;
            }
        }

        if let Some(size) = lookup("IPROTO_WRITE_QUEUE_SIZE") {
            if let Ok(n) = size.parse() {
                self.write_queue_size = n;
            }
        }

        if let Some(timeout) = lookup("IPROTO_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Some(timeout) = lookup("IPROTO_SHUTDOWN_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.shutdown_timeout_ms = ms;
            }
        }

        if let Some(enabled) = lookup("IPROTO_BYTE_POOL") {
            self.byte_pool = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validates channel settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_body_len == 0 {
            return Err(ConfigError::ValidationError(
                "max_body_len must be greater than zero".to_string(),
            ));
        }
        if self.write_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "write_queue_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the channel configuration serving requests with `handler`.
    pub fn channel_config(&self, handler: impl Handler) -> ChannelConfig {
        let byte_pool = if self.byte_pool {
            BytePool::new()
        } else {
            BytePool::disabled()
        };
        ChannelConfig::new()
            .with_handler(handler)
            .with_max_body_len(self.max_body_len)
            .with_write_queue_size(self.write_queue_size)
            .with_request_timeout(self.request_timeout())
            .with_shutdown_timeout(self.shutdown_timeout())
            .with_byte_pool(byte_pool)
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Serde helpers for SocketAddr (stored as a string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(addr)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
