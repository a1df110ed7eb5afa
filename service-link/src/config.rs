//! Configuration for service-link
//!
//! Timing and sizing knobs for the multiplexing client and the individual
//! streams. Every field has a default matching the controller's protocol
//! constants, so an empty TOML table is a valid configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level library configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Settings for the `ServiceClient` threads
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Upper bound on one select wait of the I/O thread (default: 100)
    #[serde(default = "default_select_timeout")]
    pub select_timeout_ms: u64,

    /// Period of the heartbeat task (default: 500)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Period of the liveness check task (default: 500)
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// How often the selector re-probes idle sockets (default: 2)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Settings applied to each TCP/UDP stream
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Silence after which a locked stream is considered dead (default: 5000)
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,

    /// Bounded wait for the LISTXML reply (default: 250)
    #[serde(default = "default_list_timeout")]
    pub list_timeout_ms: u64,

    /// TCP connect timeout (default: 3000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Largest frame accepted from the controller, in bytes (default: 16 MiB)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
}

fn default_select_timeout() -> u64 {
    100
}

fn default_heartbeat_interval() -> u64 {
    500
}

fn default_check_interval() -> u64 {
    500
}

fn default_poll_interval() -> u64 {
    2
}

fn default_liveness_timeout() -> u64 {
    5000
}

fn default_list_timeout() -> u64 {
    250
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_max_frame_size() -> u32 {
    16 * 1024 * 1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            select_timeout_ms: default_select_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            check_interval_ms: default_check_interval(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: default_liveness_timeout(),
            list_timeout_ms: default_list_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ClientConfig {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl StreamConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

impl LinkConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use service_link::config::LinkConfig;
    ///
    /// let config = LinkConfig::from_file("service-link.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}
