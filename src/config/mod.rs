//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`GNUTELLA_*`)
//! - CLI arguments (for the `gnutella` binary)
//!
//! The connection engine itself never reads files or the environment; it
//! receives a [`Config`] (or pieces of it) as plain parameters.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GnutellaError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Handshake configuration
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Message framing limits
    #[serde(default)]
    pub messages: MessageConfig,

    /// Outbound queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Network identity and connect settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// I/O model selection
    #[serde(default)]
    pub io: IoConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| GnutellaError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| GnutellaError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`<config dir>/gnutella/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gnutella").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `GNUTELLA_*` environment variables
    pub fn apply_env(&mut self) {
        if let Some(val) = env_parse("GNUTELLA_HANDSHAKE_TIMEOUT_SECS") {
            self.handshake.timeout_secs = val;
        }
        if let Some(val) = env_parse("GNUTELLA_SOFT_MAX_TTL") {
            self.messages.soft_max_ttl = val;
        }
        if let Some(val) = env_parse("GNUTELLA_MAX_PAYLOAD") {
            self.messages.max_payload = val;
        }
        if let Some(val) = env_parse("GNUTELLA_FORCE_IP") {
            self.network.force_ip = val;
        }
        if let Some(val) = env_parse("GNUTELLA_FORCED_ADDRESS") {
            self.network.forced_address = Some(val);
        }
        if let Some(val) = env_parse("GNUTELLA_LISTEN_PORT") {
            self.network.listen_port = val;
        }
        if let Ok(model) = std::env::var("GNUTELLA_IO_MODEL") {
            if let Ok(model) = model.parse() {
                self.io.model = model;
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Per-read timeout while handshaking, in seconds
    pub timeout_secs: u64,

    /// Read timeout after we answered 401, in seconds
    pub user_input_timeout_secs: u64,

    /// Maximum number of status/header rounds
    pub max_rounds: usize,

    /// Maximum header lines per group
    pub max_headers: usize,

    /// Maximum length of a single handshake line in bytes
    pub max_line_length: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 8,
            user_input_timeout_secs: 120, // 2 minutes
            max_rounds: 5,
            max_headers: 30,
            max_line_length: 4096,
        }
    }
}

impl HandshakeConfig {
    /// Per-read timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Extended timeout used while waiting on interactive credentials
    pub fn user_input_timeout(&self) -> Duration {
        Duration::from_secs(self.user_input_timeout_secs)
    }
}

/// Message framing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Largest accepted payload in bytes
    pub max_payload: u32,

    /// Soft TTL ceiling before per-peer adjustment
    pub soft_max_ttl: u8,

    /// Hard protocol maximum for `ttl + hops`
    pub hard_max_ttl: u8,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_payload: 65536,
            soft_max_ttl: 3,
            hard_max_ttl: 14,
        }
    }
}

/// Outbound queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max age for latency-sensitive classes, in milliseconds
    pub short_timeout_ms: u64,

    /// Max age for the remaining timed classes, in milliseconds
    pub normal_timeout_ms: u64,

    /// Capacity of the large classes
    pub big_capacity: usize,

    /// Capacity of the ping and ping-reply classes
    pub normal_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            short_timeout_ms: 5_000,
            normal_timeout_ms: 10_000,
            big_capacity: 100,
            normal_capacity: 8,
        }
    }
}

impl QueueConfig {
    /// Short timeout as a [`Duration`]
    pub fn short_timeout(&self) -> Duration {
        Duration::from_millis(self.short_timeout_ms)
    }

    /// Normal timeout as a [`Duration`]
    pub fn normal_timeout(&self) -> Duration {
        Duration::from_millis(self.normal_timeout_ms)
    }
}

/// Network identity and connect settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Trust the peer-reported `Remote-IP` over our own belief
    pub force_ip: bool,

    /// Address to advertise when `force_ip` is set
    pub forced_address: Option<IpAddr>,

    /// Outgoing connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Port we accept incoming connections on
    pub listen_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            force_ip: false,
            forced_address: None,
            connect_timeout_secs: 6,
            listen_port: 6346,
        }
    }
}

impl NetworkConfig {
    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Concurrency model for connection I/O
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoModel {
    /// Reader and writer thread per connection
    #[default]
    Blocking,
    /// Single readiness loop for all connections
    Nio,
}

impl IoModel {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Nio => "nio",
        }
    }
}

impl std::fmt::Display for IoModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for IoModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocking" | "bio" | "threads" => Ok(Self::Blocking),
            "nio" | "nonblocking" | "non-blocking" => Ok(Self::Nio),
            _ => Err(format!("Unknown I/O model: {}", s)),
        }
    }
}

/// I/O model selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Active model, chosen once per process
    pub model: IoModel,
}
