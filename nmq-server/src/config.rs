//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via NMQ_CONFIG or --config)
//! 3. Environment variables

use nmq_protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT};
use nmq_snowflake::{
    node_id_from_name, BitLayout, Settings, DEFAULT_EPOCH_MS, DEFAULT_NODE_BITS,
    DEFAULT_STEP_BITS,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub network: NetworkConfig,
    /// Id generator configuration.
    pub node: NodeConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from the file named by `NMQ_CONFIG` (if set), then
    /// applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None::<PathBuf>)
    }

    /// Like [`Config::load`], but an explicit `path` takes precedence over
    /// `NMQ_CONFIG`.
    pub fn load_from(path: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => Some(p.as_ref().to_path_buf()),
            None => std::env::var_os("NMQ_CONFIG").map(PathBuf::from),
        };

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

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
        self.node.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks values that serde cannot: bit layout, node range, limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.node.validate()?;
        Ok(())
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

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listener network: `tcp`, `tcp4` or `tcp6`.
    pub network: String,
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Upper bound on a single socket read, in milliseconds.
    pub read_timeout_ms: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: usize,
    /// Largest assembled message in bytes.
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            read_timeout_ms: 10,
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(network) = std::env::var("NMQ_NETWORK") {
            self.network = network;
        }

        if let Ok(addr) = std::env::var("NMQ_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("NMQ_READ_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.read_timeout_ms = ms;
            }
        }

        if let Ok(max) = std::env::var("NMQ_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(max) = std::env::var("NMQ_MAX_MESSAGE_SIZE") {
            if let Ok(n) = max.parse() {
                self.max_message_size = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.network.as_str(), "tcp" | "tcp4" | "tcp6") {
            return Err(ConfigError::ValidationError(format!(
                "network must be tcp, tcp4 or tcp6, got {:?}",
                self.network
            )));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "read_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.max_frame_size == 0 || self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_frame_size and max_message_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Id generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Component name; the node number is derived from it when `id` is unset.
    pub name: String,
    /// Explicit node number.
    pub id: Option<i64>,
    pub node_bits: u8,
    pub step_bits: u8,
    /// Generator epoch in Unix milliseconds.
    pub epoch_ms: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "nmq".to_string(),
            id: None,
            node_bits: DEFAULT_NODE_BITS,
            step_bits: DEFAULT_STEP_BITS,
            epoch_ms: DEFAULT_EPOCH_MS,
        }
    }
}

impl NodeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("NMQ_NODE_NAME") {
            self.name = name;
        }

        if let Ok(id) = std::env::var("NMQ_NODE_ID") {
            if let Ok(n) = id.parse() {
                self.id = Some(n);
            }
        }

        if let Ok(bits) = std::env::var("NMQ_NODE_BITS") {
            if let Ok(n) = bits.parse() {
                self.node_bits = n;
            }
        }

        if let Ok(bits) = std::env::var("NMQ_STEP_BITS") {
            if let Ok(n) = bits.parse() {
                self.step_bits = n;
            }
        }

        if let Ok(epoch) = std::env::var("NMQ_EPOCH_MS") {
            if let Ok(ms) = epoch.parse() {
                self.epoch_ms = ms;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let layout = self.layout()?;
        if let Some(id) = self.id {
            if id < 0 || id > layout.node_max() {
                return Err(ConfigError::ValidationError(format!(
                    "node id must be between 0 and {}, got {}",
                    layout.node_max(),
                    id
                )));
            }
        }
        Ok(())
    }

    /// Returns the configured bit layout.
    pub fn layout(&self) -> Result<BitLayout, ConfigError> {
        BitLayout::new(self.node_bits, self.step_bits)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Returns the explicit node id, or one derived from `name`.
    pub fn node_id(&self) -> Result<i64, ConfigError> {
        let layout = self.layout()?;
        Ok(self
            .id
            .unwrap_or_else(|| node_id_from_name(&self.name, layout)))
    }

    /// Returns generator settings for this configuration.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        Ok(Settings::default()
            .with_epoch_ms(self.epoch_ms)
            .with_layout(self.layout()?))
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("NMQ_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("NMQ_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
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
