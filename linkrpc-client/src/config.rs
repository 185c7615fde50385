//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via LINKRPC_CONFIG or --config)
//! 3. Environment variables

use crate::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "LINKRPC_CONFIG";

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Peer address and dialing.
    pub link: LinkConfig,
    /// Dispatcher behaviour.
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Loads `path` (or defaults when `None`), then applies environment
    /// variable overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.addr.trim().is_empty() {
            return Err(ConfigError::Validation("link.addr must not be empty".into()));
        }
        if self.dispatch.auto_reconnect && self.dispatch.reconnect_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatch.reconnect_interval_secs must be positive when auto_reconnect is on"
                    .into(),
            ));
        }
        Ok(())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.link.apply_overrides(&lookup);
        self.dispatch.apply_overrides(&lookup);
    }
}

/// Peer address and dialing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Address of the peer, `host:port`.
    pub addr: String,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", linkrpc_protocol::DEFAULT_PORT),
            connect_timeout_secs: 10,
        }
    }
}

impl LinkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("LINKRPC_ADDR") {
            self.addr = addr;
        }

        if let Some(timeout) = lookup("LINKRPC_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.connect_timeout_secs = secs;
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Dispatcher behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Reconnect after an unexpected disconnect.
    pub auto_reconnect: bool,
    /// Maximum reconnect attempts (0 or less = unlimited).
    pub reconnect_retry_limit: i64,
    /// Seconds to wait before each reconnect attempt.
    pub reconnect_interval_secs: u64,
    /// Default deadline for calls in seconds (0 = wait forever).
    pub call_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_retry_limit: 0,
            reconnect_interval_secs: 3,
            call_timeout_secs: 30,
        }
    }
}

impl DispatchConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("LINKRPC_AUTO_RECONNECT") {
            self.auto_reconnect = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Some(limit) = lookup("LINKRPC_RECONNECT_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.reconnect_retry_limit = n;
            }
        }

        if let Some(interval) = lookup("LINKRPC_RECONNECT_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.reconnect_interval_secs = secs;
            }
        }

        if let Some(timeout) = lookup("LINKRPC_CALL_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.call_timeout_secs = secs;
            }
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Returns the call deadline, `None` when disabled.
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_settings(
            self.auto_reconnect,
            self.reconnect_retry_limit,
            self.reconnect_interval(),
        )
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
