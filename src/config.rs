//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults (every field has one)
//! 2. `config/cellsim.toml` (or an explicit path), if present
//! 3. Environment variables prefixed with `CELLSIM_`, using `__` between
//!    section and key
//!
//! # Example
//! ```no_run
//! use cellsim::config::CellSimConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // CELLSIM_CLIENT__DEFAULT_TIMEOUT_MS=500 overrides the file value
//! let config = CellSimConfig::load()?;
//! config.validate()?;
//! println!("Channels: {}", config.device.channel_count);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CellSimError, CellSimResult};
use crate::protocol::Command;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/cellsim.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellSimConfig {
    /// Serial link settings
    pub link: LinkConfig,
    /// Command/response transport settings
    pub client: ClientConfig,
    /// Discovery probe settings
    pub discovery: DiscoveryConfig,
    /// Instrument shape
    pub device: DeviceConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Baud rate (the instrument enumerates as USB CDC, so this is nominal)
    pub baud_rate: u32,
}

/// Per-call deadlines of the command client.
///
/// Commands are grouped into categories by verb; each category has its own
/// deadline. All default to one second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for commands without a dedicated category (ms)
    pub default_timeout_ms: u64,
    /// Deadline for `SETV` / `SETALLV` (ms)
    pub set_voltage_timeout_ms: u64,
    /// Deadline for `GETALLV` / `GETALLI` (ms)
    pub bulk_read_timeout_ms: u64,
    /// Back-off when the link reports end of input (ms)
    pub poll_interval_ms: u64,
}

/// Discovery probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Liveness command sent to every candidate
    pub probe_command: String,
    /// Payload expected inside the first `OK:` reply
    pub expected_ack: String,
}

/// Instrument shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of cell channels (channels are numbered from 1)
    pub channel_count: u8,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

/// Command categories with separately configurable deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    /// `SETV`, `SETALLV`
    SetVoltage,
    /// `GETALLV`, `GETALLI`
    BulkRead,
    /// Everything else
    Other,
}

impl CommandCategory {
    /// Categorise a command by its verb.
    pub fn of(command: &Command) -> Self {
        match command.verb() {
            "SETV" | "SETALLV" => CommandCategory::SetVoltage,
            "GETALLV" | "GETALLI" => CommandCategory::BulkRead,
            _ => CommandCategory::Other,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { baud_rate: 115_200 }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 1000,
            set_voltage_timeout_ms: 1000,
            bulk_read_timeout_ms: 1000,
            poll_interval_ms: 1,
        }
    }
}

impl ClientConfig {
    /// Same deadline for every category.
    ///
    /// Rounded to whole milliseconds, never below 1 ms.
    pub fn uniform(timeout: Duration) -> Self {
        let ms = u64::try_from(timeout.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        Self {
            default_timeout_ms: ms,
            set_voltage_timeout_ms: ms,
            bulk_read_timeout_ms: ms,
            ..Default::default()
        }
    }

    /// Deadline for one call of `command`.
    pub fn timeout_for(&self, command: &Command) -> Duration {
        let ms = match CommandCategory::of(command) {
            CommandCategory::SetVoltage => self.set_voltage_timeout_ms,
            CommandCategory::BulkRead => self.bulk_read_timeout_ms,
            CommandCategory::Other => self.default_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Back-off interval when no input can be read.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_command: "PING".to_string(),
            expected_ack: "PONG".to_string(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { channel_count: 16 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl CellSimConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and environment variables.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> CellSimResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path plus environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CellSimResult<Self> {
        let config = Figment::from(Serialized::defaults(CellSimConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CELLSIM_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> CellSimResult<()> {
        let timeouts = [
            ("default_timeout_ms", self.client.default_timeout_ms),
            ("set_voltage_timeout_ms", self.client.set_voltage_timeout_ms),
            ("bulk_read_timeout_ms", self.client.bulk_read_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(CellSimError::Configuration(format!(
                    "client.{} must be greater than zero",
                    name
                )));
            }
        }

        if self.device.channel_count == 0 {
            return Err(CellSimError::Configuration(
                "device.channel_count must be at least 1".into(),
            ));
        }

        if self.link.baud_rate == 0 {
            return Err(CellSimError::Configuration(
                "link.baud_rate must be greater than zero".into(),
            ));
        }

        Command::new(self.discovery.probe_command.as_str()).map_err(|e| {
            CellSimError::Configuration(format!("discovery.probe_command: {}", e))
        })?;
        if self.discovery.expected_ack.trim().is_empty() {
            return Err(CellSimError::Configuration(
                "discovery.expected_ack must not be empty".into(),
            ));
        }

        crate::logging::parse_log_level(&self.logging.level)
            .map_err(CellSimError::Configuration)?;
        crate::logging::OutputFormat::parse(&self.logging.format)
            .map_err(CellSimError::Configuration)?;

        Ok(())
    }

    /// Render as TOML (effective configuration dump).
    pub fn to_toml(&self) -> CellSimResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CellSimError::Configuration(format!("cannot serialise config: {}", e)))
    }
}
