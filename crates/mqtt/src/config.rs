//! Configuration structures for a device session.
//!
//! All configs support serde deserialization (the agent loads them from TOML)
//! and carry `validator` constraints, so a bad file fails at load time rather
//! than on the first connect.
//!
//! # Examples
//!
//! ```toml
//! client_id = "sensor-0042"
//! host = "hub.example.net"
//! port = 1883
//! keep_alive = 60
//! clean_session = false
//!
//! [reconnect]
//! initial_delay_ms = 1000
//! max_delay_ms = 60000
//! multiplier = 2.0
//! max_attempts = 0  # Unlimited
//!
//! [will]
//! topic = "devices/sensor-0042/status"
//! payload = "offline"
//! qos = 1
//! retain = true
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Main session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Device identity presented in CONNECT.
    ///
    /// Brokers use it to find a persistent session (when `clean_session` is
    /// false) and to enforce client-id uniqueness.
    #[validate(length(
        min = 1,
        max = 128,
        message = "Client ID must be between 1 and 128 characters"
    ))]
    pub client_id: String,

    /// Broker hostname or IP address, used by the TCP connector.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port number (1883 plain MQTT, 8883 behind a TLS terminator).
    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Keep-alive interval in seconds. 0 disables PINGREQ supervision.
    #[validate(range(max = 65535, message = "Keep alive must fit in 16 bits"))]
    pub keep_alive: u64,

    /// Whether to ask the broker for a clean session.
    ///
    /// If true, every successful connect discards pending deliveries.
    /// If false, the broker may resume the session and pending deliveries are
    /// replayed after reconnection.
    pub clean_session: bool,

    /// Seconds to wait for the transport to open and CONNACK to arrive.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Maximum number of QoS 1 and QoS 2 deliveries pending at once.
    #[validate(range(
        min = 1,
        max = 65535,
        message = "Max inflight must be between 1 and 65535"
    ))]
    pub max_inflight: u16,

    /// Maximum MQTT packet size in bytes, enforced by the TCP binding codec.
    #[validate(range(
        min = 64,
        max = 268435455,
        message = "Max packet size must be between 64 bytes and 256 MiB"
    ))]
    pub max_packet_size: usize,

    /// Capacity of the command channel between handles and the kernel.
    #[validate(range(
        min = 1,
        max = 4096,
        message = "Command channel capacity must be between 1 and 4096"
    ))]
    pub command_channel_capacity: usize,

    /// Seconds after which an unacknowledged delivery is abandoned instead of
    /// replayed on reconnect. 0 keeps deliveries until the session ends.
    pub delivery_timeout: u64,

    /// Reconnect/backoff policy.
    #[validate(nested)]
    pub reconnect: ReconnectConfig,

    /// Optional last-will message registered at connect time.
    #[validate(nested)]
    pub will: Option<WillConfig>,

    /// Optional static credentials attached to CONNECT.
    #[validate(nested)]
    pub credentials: Option<CredentialsConfig>,
}

impl Config {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    pub fn delivery_timeout(&self) -> Option<Duration> {
        (self.delivery_timeout > 0).then(|| Duration::from_secs(self.delivery_timeout))
    }
}

impl Default for Config {
    /// Development defaults: localhost broker, persistent session, no will.
    fn default() -> Self {
        Config {
            client_id: Uuid::new_v4().to_string(),
            host: "localhost".to_string(),
            port: 1883,
            keep_alive: 60,
            clean_session: false,
            connection_timeout: 30,
            max_inflight: 100,
            max_packet_size: 256 * 1024,
            command_channel_capacity: 64,
            delivery_timeout: 0,
            reconnect: ReconnectConfig::default(),
            will: None,
            credentials: None,
        }
    }
}

/// Reconnect policy settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt, in milliseconds.
    #[validate(range(
        min = 1,
        max = 600000,
        message = "Initial delay must be between 1 ms and 10 minutes"
    ))]
    pub initial_delay_ms: u64,

    /// Cap for the exponential delay, in milliseconds.
    #[validate(range(
        min = 1,
        max = 3600000,
        message = "Max delay must be between 1 ms and 1 hour"
    ))]
    pub max_delay_ms: u64,

    /// Exponential growth factor applied after each attempt.
    #[validate(
        range(min = 1.0, max = 30.0, message = "Multiplier must be between 1.0 and 30.0"),
        custom(function = "validate_finite")
    )]
    pub multiplier: f64,

    /// Fraction of each delay used as random jitter (0.0 disables).
    #[validate(
        range(min = 0.0, max = 1.0, message = "Jitter must be between 0.0 and 1.0"),
        custom(function = "validate_finite")
    )]
    pub jitter: f64,

    /// Give up after this many attempts. 0 retries forever.
    pub max_attempts: u32,

    /// Give up after this many seconds of failed attempts. 0 disables.
    pub max_elapsed_secs: u64,
}

/// `range` lets NaN through since every comparison with it is false.
fn validate_finite(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        return Ok(());
    }
    let mut err = ValidationError::new("not_finite");
    err.message = Some(format!("Expected a finite number, got {}", value).into());
    Err(err)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 0,
            max_elapsed_secs: 0,
        }
    }
}

/// Last-will message as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WillConfig {
    /// Topic the broker publishes the will on.
    #[validate(length(min = 1, message = "Will topic must not be empty"))]
    pub topic: String,

    /// UTF-8 payload of the will.
    #[serde(default)]
    pub payload: String,

    /// Raw QoS; anything but 0, 1 or 2 is rejected.
    #[serde(default = "default_will_qos")]
    #[validate(range(max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    #[serde(default)]
    pub retain: bool,
}

fn default_will_qos() -> u8 {
    1
}

/// Static username/password pair.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct CredentialsConfig {
    #[validate(length(min = 1, message = "Username must not be empty"))]
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
