//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. built-in defaults (the values the WebSQ server ships with)
//! 2. a TOML file (e.g. `config/websq.toml`)
//! 3. environment variables prefixed with `WEBSQ_`, using `__` between
//!    section and key (e.g. `WEBSQ_DEVICE__HOST=192.168.1.1`)
//!
//! # Example
//! ```no_run
//! use websq_control::config::WebSqConfig;
//!
//! let config = WebSqConfig::load()?;
//! println!("Control port: {}", config.device.control_port);
//! # Ok::<(), websq_control::error::WebSqError>(())
//! ```

use crate::error::{AppResult, WebSqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/websq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where the WebSQ server lives
    pub device: DeviceConfig,
    /// Channel tuning
    pub channels: ChannelConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (compact, pretty, json)
    pub log_format: String,
    /// Log span open/close events
    pub log_span_events: bool,
}

/// Network location of the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Hostname or IP address of the WebSQ server
    pub host: String,
    /// Port of the JSON control channel
    pub control_port: u16,
    /// Port of the counts stream
    pub counts_port: u16,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

/// Channel behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Ceiling for `ControlChannel::get` in milliseconds
    pub label_timeout_ms: u64,
    /// Number of samples retained by the counts ring buffer
    pub counts_buffer: usize,
    /// Size of each socket read
    pub read_buffer_bytes: usize,
    /// Polling interval used while waiting for auto calibration
    pub calibration_poll_ms: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            log_span_events: false,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            control_port: 12000,
            counts_port: 12345,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            label_timeout_ms: 10_000,
            counts_buffer: 100,
            read_buffer_bytes: 64 * 1024,
            calibration_poll_ms: 500,
        }
    }
}

impl DeviceConfig {
    /// `host:port` of the control channel
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// `host:port` of the counts channel
    pub fn counts_addr(&self) -> String {
        format!("{}:{}", self.host, self.counts_port)
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ChannelConfig {
    /// Label wait ceiling as a `Duration`
    pub fn label_timeout(&self) -> Duration {
        Duration::from_millis(self.label_timeout_ms)
    }

    /// Calibration poll interval as a `Duration`
    pub fn calibration_poll(&self) -> Duration {
        Duration::from_millis(self.calibration_poll_ms)
    }
}

impl WebSqConfig {
    /// Load configuration from `config/websq.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WEBSQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(WebSqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["compact", "pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(WebSqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.device.host.trim().is_empty() {
            return Err(WebSqError::Configuration("device.host is empty".into()));
        }

        if self.device.control_port == self.device.counts_port {
            return Err(WebSqError::Configuration(format!(
                "control_port and counts_port are both {}",
                self.device.control_port
            )));
        }

        if self.channels.counts_buffer == 0 {
            return Err(WebSqError::Configuration(
                "channels.counts_buffer must be at least 1".into(),
            ));
        }

        if self.channels.calibration_poll_ms == 0 {
            return Err(WebSqError::Configuration(
                "channels.calibration_poll_ms must be at least 1".into(),
            ));
        }

        if self.channels.read_buffer_bytes == 0 {
            return Err(WebSqError::Configuration(
                "channels.read_buffer_bytes must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
