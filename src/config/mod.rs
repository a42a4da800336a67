//! Agent configuration loading and validation.
//!
//! The agent reads one TOML file holding the `[logger]`, `[transport]` and
//! `[telemetry]` sections. It is loaded once at startup, before the tracing
//! subscriber exists, and stays immutable afterwards.
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [transport]
//! client_id = "sensor-0042"
//! host = "hub.example.net"
//!
//! [transport.will]
//! topic = "devices/sensor-0042/status"
//! payload = "offline"
//!
//! [telemetry]
//! topic = "devices/sensor-0042/telemetry"
//! qos = 1
//! interval_secs = 30
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use validator::Validate;

use crate::config::logger::LoggerConfig;

pub mod logger;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "DEVICE_AGENT_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/device-agent/config.toml";

/// UTC timestamp for messages printed before the subscriber is initialized.
#[doc(hidden)]
pub fn print_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Timestamped console messages for use before the tracing subscriber is
/// initialized, i.e. while the configuration is being loaded.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {{
        println!("{}  {} {}",
            console::style($crate::config::print_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {{
        println!("{}  {} {}",
            console::style($crate::config::print_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    }};
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {{
        eprintln!("{}  {} {}",
            console::style($crate::config::print_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    }};
}

/// Errors raised while locating, reading, parsing or validating the file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Session settings handed to the MQTT core unchanged.
    #[validate(nested)]
    pub transport: device_mqtt::Config,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// What the agent publishes and how often.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TelemetryConfig {
    #[validate(length(min = 1, message = "Telemetry topic must not be empty"))]
    pub topic: String,

    #[validate(range(max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    #[validate(range(min = 1, max = 86400, message = "Interval must be between 1 second and 1 day"))]
    pub interval_secs: u64,

    pub retain: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            topic: "devices/telemetry".to_string(),
            qos: 1,
            interval_secs: 30,
            retain: false,
        }
    }
}

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// `DEVICE_AGENT_CONFIG` first, then `/etc/device-agent/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {} or create {}",
            CONFIG_ENV, DEFAULT_CONFIG_PATH
        )))
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "File does not exist: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&config_str)?;
        config.validate()?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }
}
