//! JSON configuration: transport selection, timeouts, monitored parameters and log level.

use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};

use crate::command::Parameter;
use crate::error::ConfigError;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

/// Bluetooth LE adapter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleConfig {
    /// Connect to the first peripheral whose advertised name starts with this
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Exact peripheral id; takes precedence over `name_prefix`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// 16-bit UUID of the serial service
    #[serde(default = "default_service_uuid")]
    pub service_uuid: u16,
    #[serde(default = "default_write_uuid")]
    pub write_uuid: u16,
    #[serde(default = "default_notify_uuid")]
    pub notify_uuid: u16,
}

fn default_name_prefix() -> String {
    "OBDII".to_string()
}

const fn default_scan_timeout_ms() -> u64 {
    10_000
}

const fn default_service_uuid() -> u16 {
    0xFFF0
}

const fn default_write_uuid() -> u16 {
    0xFFF2
}

const fn default_notify_uuid() -> u16 {
    0xFFF1
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            device_id: None,
            scan_timeout_ms: default_scan_timeout_ms(),
            service_uuid: default_service_uuid(),
            write_uuid: default_write_uuid(),
            notify_uuid: default_notify_uuid(),
        }
    }
}

impl BleConfig {
    /// Device id if set, otherwise the name prefix
    pub fn target(&self) -> &str {
        self.device_id.as_deref().unwrap_or(&self.name_prefix)
    }

    #[cfg(feature = "ble")]
    pub fn profile(&self) -> crate::transport::BleProfile {
        crate::transport::BleProfile {
            service: self.service_uuid,
            write: self.write_uuid,
            notify: self.notify_uuid,
        }
    }
}

/// WiFi adapter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "192.168.0.10".to_string()
}

const fn default_port() -> u16 {
    35000
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Ble(BleConfig),
    Tcp(TcpConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Ble(BleConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    /// Timeout for establishing the link
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-command timeout during the handshake
    #[serde(default = "default_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Per-command timeout for supported-PID queries
    #[serde(default = "default_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Per-command timeout while polling
    #[serde(default = "default_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Sleep between checks while nothing is monitored
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Parameters to poll, in order
    #[serde(default = "default_monitored")]
    pub monitored: Vec<Parameter>,
}

pub const MIN_TIMEOUT_MS: u64 = 100;
pub const MAX_TIMEOUT_MS: u64 = 60_000;
pub const MIN_IDLE_INTERVAL_MS: u64 = 10;

const fn default_timeout_ms() -> u64 {
    10_000
}

const fn default_idle_interval_ms() -> u64 {
    100
}

fn default_monitored() -> Vec<Parameter> {
    Parameter::all().collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            connect_timeout_ms: default_timeout_ms(),
            handshake_timeout_ms: default_timeout_ms(),
            discovery_timeout_ms: default_timeout_ms(),
            poll_timeout_ms: default_timeout_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            log_level: LogLevel::default(),
            monitored: default_monitored(),
        }
    }
}

fn clamp_timeout(name: &str, value: &mut u64) {
    let clamped = (*value).clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
    if clamped != *value {
        warn!("Clamping {name} from {value} to {clamped}");
        *value = clamped;
    }
}

impl Config {
    /// Clamp values to valid ranges and repair empty fields
    pub fn validate(&mut self) {
        clamp_timeout("connect_timeout_ms", &mut self.connect_timeout_ms);
        clamp_timeout("handshake_timeout_ms", &mut self.handshake_timeout_ms);
        clamp_timeout("discovery_timeout_ms", &mut self.discovery_timeout_ms);
        clamp_timeout("poll_timeout_ms", &mut self.poll_timeout_ms);

        if self.idle_interval_ms < MIN_IDLE_INTERVAL_MS {
            warn!(
                "Clamping idle_interval_ms from {} to {MIN_IDLE_INTERVAL_MS}",
                self.idle_interval_ms
            );
            self.idle_interval_ms = MIN_IDLE_INTERVAL_MS;
        }

        match &mut self.transport {
            TransportConfig::Ble(ble) => {
                if ble.name_prefix.is_empty() && ble.device_id.is_none() {
                    warn!("BLE name prefix is empty, resetting to default");
                    ble.name_prefix = default_name_prefix();
                }
                clamp_timeout("scan_timeout_ms", &mut ble.scan_timeout_ms);
            }
            TransportConfig::Tcp(tcp) => {
                if tcp.host.is_empty() {
                    warn!("TCP host is empty, resetting to default");
                    tcp.host = default_host();
                }
                if tcp.port == 0 {
                    warn!("TCP port is 0, resetting to default");
                    tcp.port = default_port();
                }
            }
        }

        let before = self.monitored.len();
        let mut seen = indexmap::IndexSet::new();
        self.monitored.retain(|p| seen.insert(*p));
        if self.monitored.len() != before {
            warn!("Removed {} duplicate monitored parameters", before - self.monitored.len());
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(mut config) => {
                info!("Loaded config from {}", path.display());
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config from {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());
        let json = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&json)?;
        debug!(
            "Config parsed: transport={:?}, log_level={:?}",
            config.transport, config.log_level
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        debug!("Saving config to {}", path.display());
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Config saved to {}", path.display());
        Ok(())
    }
}
