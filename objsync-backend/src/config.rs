//! Backend configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via OBJSYNC_CONFIG)
//! 3. Environment variables

use objsync_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Reclamation epoch tuning.
    pub sync: SyncConfig,
    /// Per-connection limits.
    pub limits: LimitsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("OBJSYNC_CONFIG") {
            Ok(path) => Self::load_from(path),
            Err(_) => {
                let config = Self::from_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Loads configuration from `path`, then applies environment variable
    /// overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
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

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.sync.apply_env_overrides();
        self.limits.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()?;
        self.limits.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Serve a single connection over stdin/stdout instead of TCP.
    pub stdio: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_connections: 64,
            stdio: false,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("OBJSYNC_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("OBJSYNC_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(stdio) = std::env::var("OBJSYNC_STDIO") {
            self.stdio = stdio == "1" || stdio.to_lowercase() == "true";
        }
    }
}

/// Reclamation epoch tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Start an epoch once more than this many objects were activated.
    pub object_threshold: usize,
    /// Delay before an unreferenced object may be removed.
    pub grace_period_ms: u64,
    /// Minimum spacing of epochs started only to reclaim released objects.
    pub sync_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            object_threshold: 200,
            grace_period_ms: 5000,
            sync_interval_ms: 1000,
        }
    }
}

impl SyncConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(threshold) = std::env::var("OBJSYNC_SYNC_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                self.object_threshold = n;
            }
        }

        if let Ok(grace) = std::env::var("OBJSYNC_GRACE_PERIOD_MS") {
            if let Ok(ms) = grace.parse() {
                self.grace_period_ms = ms;
            }
        }

        if let Ok(interval) = std::env::var("OBJSYNC_SYNC_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.sync_interval_ms = ms;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sync_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the grace period as Duration.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Returns the sync interval as Duration.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Per-connection limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of instantiable types.
    pub max_types: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_types: 10 }
    }
}

impl LimitsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("OBJSYNC_MAX_TYPES") {
            if let Ok(n) = max.parse() {
                self.max_types = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_types == 0 {
            return Err(ConfigError::ValidationError(
                "max_types must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
