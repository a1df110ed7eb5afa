//! Probe configuration
//!
//! ```toml
//! [connection]
//! host = "192.168.68.101"
//! transport = "udp"
//! # port defaults to 10001 (tcp) / 10002 (udp)
//!
//! [logging]
//! level = "debug"
//!
//! [client]
//! heartbeat_interval_ms = 500
//!
//! [stream]
//! liveness_timeout_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use service_link::config::{ClientConfig, StreamConfig};
use service_link::{Result, StreamKind};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Controller address
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Controller host (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// tcp or udp (default: tcp)
    #[serde(default)]
    pub transport: StreamKind,

    /// Overrides the transport's default port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            transport: StreamKind::default(),
            port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport.default_port())
    }
}

impl ProbeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ProbeConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}
