//! Configuration management for groundlink.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::link::{BaudRate, LinkSettings};
use crate::telemetry::Schema;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "groundlink";

/// Default directory for launch logs, under the data directory.
const LAUNCH_DIR_NAME: &str = "Launch_Data";

/// Prefix for environment overrides, e.g. `GROUNDLINK_LINK__PORT`.
const ENV_PREFIX: &str = "GROUNDLINK_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `GROUNDLINK_`, sections split on `__`)
/// 2. TOML config file at `~/.config/groundlink/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial link configuration.
    pub link: LinkConfig,
    /// Telemetry decoding configuration.
    pub telemetry: TelemetryConfig,
    /// Push channel configuration.
    pub broadcast: BroadcastConfig,
    /// Launch log configuration.
    pub recorder: RecorderConfig,
}

/// Serial link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial port to open (e.g. `/dev/ttyUSB0` or `COM3`).
    pub port: Option<String>,
    /// Baud rate.
    pub baud: BaudRate,
    /// Read timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// How long a disconnect waits for the read loop, in milliseconds.
    pub disconnect_grace_ms: u64,
    /// Reopen attempts after the transport is lost.
    pub reconnect_attempts: u32,
    /// Pause before each reopen attempt, in milliseconds.
    pub reconnect_delay_ms: u64,
}

/// Telemetry decoding configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// The field layout this deployment's flight computer sends.
    pub schema: Schema,
}

/// Push channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// WebSocket listen address. `None` disables the endpoint.
    pub websocket_listen: Option<SocketAddr>,
    /// Newline-delimited TCP listen address. `None` disables the endpoint.
    pub tcp_listen: Option<SocketAddr>,
    /// Frames queued per subscriber before it is dropped.
    pub queue_capacity: usize,
    /// Per-frame send timeout in milliseconds.
    pub send_timeout_ms: u64,
}

/// Launch log configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Record every frame to a launch log.
    pub enabled: bool,
    /// Directory for launch logs.
    /// Defaults to `~/.local/share/groundlink/Launch_Data`
    pub directory: Option<PathBuf>,
    /// Launch number; selects the `Launch<N>.jsonl` file.
    pub launch_number: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: BaudRate::default(),
            read_timeout_ms: 100,
            disconnect_grace_ms: 500,
            reconnect_attempts: 3,
            reconnect_delay_ms: 1000,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            websocket_listen: Some(SocketAddr::from(([0, 0, 0, 0], 8765))),
            tcp_listen: None,
            queue_capacity: 64,
            send_timeout_ms: 1000,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None, // Will be resolved to default at runtime
            launch_number: 1,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("link.read_timeout_ms", self.link.read_timeout_ms),
            ("link.disconnect_grace_ms", self.link.disconnect_grace_ms),
            ("broadcast.send_timeout_ms", self.broadcast.send_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::config_validation(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.broadcast.queue_capacity == 0 {
            return Err(Error::config_validation(
                "broadcast.queue_capacity must be greater than 0",
            ));
        }

        if let (Some(ws), Some(tcp)) = (self.broadcast.websocket_listen, self.broadcast.tcp_listen) {
            if ws == tcp && ws.port() != 0 {
                return Err(Error::config_validation(format!(
                    "websocket_listen and tcp_listen cannot share {ws}"
                )));
            }
        }

        if matches!(&self.link.port, Some(port) if port.trim().is_empty()) {
            return Err(Error::config_validation("link.port cannot be empty"));
        }

        Ok(())
    }

    /// Timing settings for the link manager.
    #[must_use]
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            read_timeout: Duration::from_millis(self.link.read_timeout_ms),
            disconnect_grace: Duration::from_millis(self.link.disconnect_grace_ms),
            reconnect_attempts: self.link.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.link.reconnect_delay_ms),
        }
    }

    /// Get the per-frame send timeout as a Duration.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast.send_timeout_ms)
    }

    /// Get the launch log directory, resolving defaults if not set.
    #[must_use]
    pub fn recorder_directory(&self) -> PathBuf {
        self.recorder
            .directory
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(LAUNCH_DIR_NAME))
    }
}
