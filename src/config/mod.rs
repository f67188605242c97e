//! # Configuration Management Module
//!
//! All runtime settings for the mirror live in one TOML file: how to reach the node,
//! how often each refresh kind runs, which repeaters to poll, and where logs go.
//!
//! ## Configuration Structure
//!
//! - [`DeviceConfig`] - transport selection and endpoint, handshake options
//! - [`PollingConfig`] - refresh intervals, backlog size, per-refresh budget
//! - [`RepeaterConfig`] - one entry per polled repeater (`[[repeaters]]`)
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshcore_mirror::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("Endpoint: {}", config.endpoint()?);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [device]
//! connection = "tcp"
//! tcp_host = "192.168.1.40"
//! tcp_port = 5000
//!
//! [polling]
//! messages_interval_secs = 10
//! info_interval_secs = 60
//!
//! [[repeaters]]
//! name = "Hilltop"
//! password = ""
//! poll_interval_secs = 300
//! ```
//!
//! Every field has a default, so a file only needs the values that differ.
//! An empty repeater password means guest login.

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::device::{Endpoint, TransportKind};

pub const DEFAULT_BAUDRATE: u32 = 115200;
pub const DEFAULT_TCP_PORT: u16 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub connection: TransportKind,
    pub usb_path: String,
    pub baudrate: u32,
    /// Empty selects the first MeshCore node found in range.
    pub ble_address: String,
    pub tcp_host: String,
    pub tcp_port: u16,
    /// Set the device clock right after the handshake.
    pub sync_time: bool,
    pub connect_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connection: TransportKind::Usb,
            usb_path: "/dev/ttyUSB0".to_string(),
            baudrate: DEFAULT_BAUDRATE,
            ble_address: String::new(),
            tcp_host: String::new(),
            tcp_port: DEFAULT_TCP_PORT,
            sync_time: false,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Tick cadence; messages are drained every tick.
    pub messages_interval_secs: u64,
    /// Node info and contacts.
    pub info_interval_secs: u64,
    /// Messages kept in the snapshot backlog.
    pub message_history: usize,
    /// Budget for one refresh kind inside a tick.
    pub refresh_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            messages_interval_secs: 10,
            info_interval_secs: 60,
            message_history: 50,
            refresh_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeaterConfig {
    /// Advertised name of the repeater contact.
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_repeater_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_repeater_poll_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshcore-mirror.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub repeaters: Vec<RepeaterConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Check cross-field rules that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        if self.device.connect_timeout_secs == 0 {
            return Err(anyhow!("device.connect_timeout_secs must be at least 1"));
        }
        let polling = &self.polling;
        if polling.messages_interval_secs == 0 || polling.info_interval_secs == 0 {
            return Err(anyhow!("polling intervals must be at least 1 second"));
        }
        if polling.refresh_timeout_secs == 0 {
            return Err(anyhow!("polling.refresh_timeout_secs must be at least 1"));
        }
        if polling.message_history == 0 {
            return Err(anyhow!("polling.message_history must be at least 1"));
        }
        let mut seen = HashSet::new();
        for repeater in &self.repeaters {
            if repeater.name.trim().is_empty() {
                return Err(anyhow!("repeater entries need a non-empty name"));
            }
            if repeater.poll_interval_secs == 0 {
                return Err(anyhow!(
                    "repeater '{}' poll_interval_secs must be at least 1",
                    repeater.name
                ));
            }
            if !seen.insert(repeater.name.as_str()) {
                return Err(anyhow!("repeater '{}' is configured twice", repeater.name));
            }
        }
        Ok(())
    }

    /// Typed endpoint for the selected connection kind.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let device = &self.device;
        match device.connection {
            TransportKind::Usb => {
                if device.usb_path.trim().is_empty() {
                    return Err(anyhow!("device.usb_path is required for usb connections"));
                }
                Ok(Endpoint::Usb {
                    path: device.usb_path.trim().to_string(),
                    baud: device.baudrate,
                })
            }
            // An empty address is allowed and means "scan for the first node".
            TransportKind::Ble => Ok(Endpoint::Ble {
                address: device.ble_address.trim().to_string(),
            }),
            TransportKind::Tcp => {
                if device.tcp_host.trim().is_empty() {
                    return Err(anyhow!("device.tcp_host is required for tcp connections"));
                }
                Ok(Endpoint::Tcp {
                    host: device.tcp_host.trim().to_string(),
                    port: device.tcp_port,
                })
            }
        }
    }
}
