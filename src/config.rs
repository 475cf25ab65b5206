//! Agent Configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables (`STATSD_*`, `BUFFER_FLUSH_INTERVAL_MS`).
//!
//! ```toml
//! log_format = "json"
//!
//! [buffer]
//! flush_interval = 1000
//! channel_capacity = 100
//!
//! [statsd]
//! addr = "127.0.0.1:8125"
//! prefix = "myapp."
//! ```

use crate::buffer::BufferConfig;
use crate::transport::UdpTransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(std::io::Error),
    /// Config file is not valid TOML for this schema
    Parse(String),
    /// Values parsed but are unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Log output format for the agent binary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Full agent configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub log_format: LogFormat,
    pub buffer: BufferConfig,
    pub statsd: UdpTransportConfig,
}

impl AgentConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(s)?;
        config.buffer.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// File (if given) then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => AgentConfig::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.statsd.apply_env();
        if let Ok(ms) = std::env::var("BUFFER_FLUSH_INTERVAL_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                ConfigError::Invalid(format!("BUFFER_FLUSH_INTERVAL_MS '{}' is not a number", ms))
            })?;
            self.buffer.flush_interval = Duration::from_millis(ms);
        }
        self.buffer.validate()
    }
}
