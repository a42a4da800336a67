//! Last-will registration and its lifecycle.
//!
//! The will is declarative: it travels inside CONNECT and the broker publishes
//! it if the connection ends without a DISCONNECT packet. The client never
//! sends the will itself, so this module only holds the value and tracks what
//! the broker is expected to do with it.

use std::fmt;

use bytes::Bytes;
use rumqttc::LastWill;

use crate::{config::WillConfig, error::TransferError, qos::QoSLevel};

/// Immutable last-will message attached to every CONNECT of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillRegistration {
    qos: QoSLevel,
    topic: String,
    payload: Bytes,
    retain: bool,
}

impl WillRegistration {
    /// Builds a registration from a raw QoS value.
    ///
    /// # Errors
    /// `TransferError::InvalidQoSLevel` when `qos` is not 0, 1 or 2.
    pub fn new(
        qos: u8,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        retain: bool,
    ) -> Result<Self, TransferError> {
        Ok(Self::with_level(QoSLevel::try_from(qos)?, topic, payload, retain))
    }

    pub fn with_level(
        qos: QoSLevel,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        retain: bool,
    ) -> Self {
        Self {
            qos,
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    pub fn qos(&self) -> QoSLevel {
        self.qos
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Codec record placed in the CONNECT packet.
    pub fn to_last_will(&self) -> LastWill {
        LastWill::new(
            self.topic.clone(),
            self.payload.to_vec(),
            self.qos.into(),
            self.retain,
        )
    }
}

impl TryFrom<&WillConfig> for WillRegistration {
    type Error = TransferError;

    fn try_from(config: &WillConfig) -> Result<Self, Self::Error> {
        WillRegistration::new(
            config.qos,
            config.topic.clone(),
            Bytes::from(config.payload.clone().into_bytes()),
            config.retain,
        )
    }
}

/// What the broker is expected to do with the registered will.
///
/// ```text
/// Registered ──(CONNACK)──> Armed ──(DISCONNECT sent)──> Discharged
///                             │
///                      (abrupt loss)
///                             ▼
///                         Triggered ──(reconnect)──> Armed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WillState {
    /// The session has no will.
    Unregistered,
    /// A will is configured but no broker holds it yet.
    Registered,
    /// The broker accepted the will on the live connection.
    Armed,
    /// A graceful DISCONNECT told the broker to drop the will.
    Discharged,
    /// The connection ended abruptly; the broker is expected to publish it.
    Triggered,
}

impl WillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WillState::Unregistered => "Unregistered",
            WillState::Registered => "Registered",
            WillState::Armed => "Armed",
            WillState::Discharged => "Discharged",
            WillState::Triggered => "Triggered",
        }
    }

    /// True only after an abrupt loss of an armed will.
    pub fn should_fire(&self) -> bool {
        matches!(self, WillState::Triggered)
    }
}

impl fmt::Display for WillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
