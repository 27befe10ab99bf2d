//! Configuration loading for the IoT gateway.
//!
//! Mirrors the teacher agent's `AgentConfig::load`/`save` pattern: a single YAML
//! document with `#[serde(default = "...")]` filling in every optional field.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Default config file path.
const DEFAULT_CONFIG_PATH: &str = "/etc/iotgateway/config.yaml";

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Southbound transport mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    Tcp,
    Udp,
    Mqtt,
}

impl Default for NetType {
    fn default() -> Self {
        NetType::Tcp
    }
}

/// Southbound server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the TCP/UDP southbound server.
    pub addr: String,

    /// Southbound transport. Empty string in the wire config defaults to `tcp`.
    #[serde(default)]
    pub net_type: NetType,

    /// Heartbeat interval in seconds. 0 coerces to 60.
    #[serde(default = "default_duration")]
    pub duration: u64,

    pub product_key: String,
    pub device_key: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub description: String,

    /// Topic the gateway subscribes to when `net_type == mqtt` (southbound tunnel).
    #[serde(default)]
    pub ser_up_topic: String,
    /// Topic the gateway publishes device writes to when `net_type == mqtt`.
    #[serde(default)]
    pub ser_down_topic: String,

    /// Per-session read timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Session-eviction sweep interval in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    #[serde(default)]
    pub packet_config: PacketConfig,
}

impl ServerConfig {
    pub fn heartbeat_duration(&self) -> std::time::Duration {
        let secs = if self.duration == 0 { 60 } else { self.duration };
        std::time::Duration::from_secs(secs)
    }

    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Packet framing mode, see `framing.rs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PacketMode {
    None,
    FixedLength,
    HeaderBodySeparate,
    Delimiter,
}

/// Framing configuration, see spec §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketConfig {
    #[serde(default = "default_packet_mode")]
    pub mode: PacketMode,
    #[serde(default)]
    pub fixed_length: usize,
    #[serde(default = "default_header_length")]
    pub header_length: usize,
    /// Delimiter bytes, given as a UTF-8 string in the config file (e.g. `"\r\n"`).
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            mode: default_packet_mode(),
            fixed_length: 0,
            header_length: default_header_length(),
            delimiter: default_delimiter(),
        }
    }
}

fn default_packet_mode() -> PacketMode {
    PacketMode::Delimiter
}
fn default_header_length() -> usize {
    4
}
fn default_delimiter() -> String {
    "\r\n".to_string()
}
fn default_duration() -> u64 {
    60
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cleanup_interval_secs() -> u64 {
    300
}

/// MQTT bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub client_certificate_key: Option<String>,
    #[serde(default)]
    pub client_certificate_cert: Option<String>,
    #[serde(default = "default_keepalive")]
    pub keep_alive_duration: u64,
    /// Same heartbeat duration semantics as `ServerConfig::duration`, kept separate because
    /// the original source carries it on the MQTT config block too.
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// Explicit opt-in for skipping TLS server-certificate verification.
    ///
    /// REDESIGN FLAG: the original source implied this whenever a client certificate was
    /// configured. This implementation never implies it — it must be set explicitly.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_client_id() -> String {
    "iotgateway".to_string()
}
fn default_keepalive() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &str) -> Result<Self> {
        let path = PathBuf::from(path);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: GatewayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &str) -> Result<()> {
        let path = PathBuf::from(path);
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
