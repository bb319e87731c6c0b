//! Configuration module
//!
//! Handles loading and saving heartwire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_MAX_PAYLOAD, DEFAULT_PORT, DEFAULT_PROTOCOL_ID, HEARTBEAT_TYPE_ID};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Wire protocol identifiers
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Protocol identifiers shared by server and client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Protocol id written in every header
    #[serde(default = "default_protocol_id")]
    pub protocol_id: i32,
    /// Type id of the heartbeat packet
    #[serde(default = "default_heartbeat_type")]
    pub heartbeat_type: i32,
    /// Largest inbound payload accepted
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

fn default_protocol_id() -> i32 {
    DEFAULT_PROTOCOL_ID
}

fn default_heartbeat_type() -> i32 {
    HEARTBEAT_TYPE_ID
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol_id: default_protocol_id(),
            heartbeat_type: default_heartbeat_type(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Heartbeat period in ms
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Per-connection read buffer
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_heartbeat_interval() -> u64 {
    2000
}

fn default_read_buffer_size() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// What the client does once the server has gone quiet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LostPolicy {
    /// Stay lost until the application restarts the session
    #[default]
    Halt,
    /// Start a fresh connection cycle on the next tick
    Reconnect,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Timeout of a single connection attempt in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Session tick period in ms
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Silence after which the connection counts as lost
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// Cap of the linear reconnect backoff
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u32,
    /// Behaviour after a lost connection
    #[serde(default)]
    pub on_lost: LostPolicy,
    /// Bytes read per tick at most
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_connect_timeout() -> u64 {
    10000
}

fn default_tick_interval() -> u64 {
    16
}

fn default_liveness_timeout() -> u64 {
    10
}

fn default_max_retry_delay() -> u32 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            tick_interval_ms: default_tick_interval(),
            liveness_timeout_secs: default_liveness_timeout(),
            max_retry_delay_secs: default_max_retry_delay(),
            on_lost: LostPolicy::default(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl ClientConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("heartwire/config.toml")),
            Some(PathBuf::from("./heartwire.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        client: ClientConfig {
            host: "game.example.net".to_string(),
            on_lost: LostPolicy::Reconnect,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
