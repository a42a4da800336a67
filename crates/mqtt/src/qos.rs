//! Quality-of-service levels and packet identifiers.

use std::fmt;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// MQTT delivery guarantee requested for a publish.
///
/// The level decides how deep the acknowledgment handshake goes:
/// - `AtMostOnce`: no acknowledgment, nothing tracked
/// - `AtLeastOnce`: PUBLISH -> PUBACK
/// - `ExactlyOnce`: PUBLISH -> PUBREC -> PUBREL -> PUBCOMP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoSLevel {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoSLevel {
    /// Whether deliveries at this level need an entry in the tracker.
    pub fn is_tracked(self) -> bool {
        !matches!(self, QoSLevel::AtMostOnce)
    }
}

impl TryFrom<u8> for QoSLevel {
    type Error = TransferError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoSLevel::AtMostOnce),
            1 => Ok(QoSLevel::AtLeastOnce),
            2 => Ok(QoSLevel::ExactlyOnce),
            other => Err(TransferError::InvalidQoSLevel(other)),
        }
    }
}

impl From<QoSLevel> for u8 {
    fn from(level: QoSLevel) -> Self {
        level as u8
    }
}

impl From<QoSLevel> for QoS {
    fn from(level: QoSLevel) -> Self {
        match level {
            QoSLevel::AtMostOnce => QoS::AtMostOnce,
            QoSLevel::AtLeastOnce => QoS::AtLeastOnce,
            QoSLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for QoSLevel {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => QoSLevel::AtMostOnce,
            QoS::AtLeastOnce => QoSLevel::AtLeastOnce,
            QoS::ExactlyOnce => QoSLevel::ExactlyOnce,
        }
    }
}

impl fmt::Display for QoSLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QoSLevel::AtMostOnce => write!(f, "AtMostOnce"),
            QoSLevel::AtLeastOnce => write!(f, "AtLeastOnce"),
            QoSLevel::ExactlyOnce => write!(f, "ExactlyOnce"),
        }
    }
}

/// Non-zero identifier correlating a publish with its acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(u16);

impl PacketId {
    /// Returns `None` for zero, which MQTT reserves.
    pub fn new(value: u16) -> Option<Self> {
        (value != 0).then_some(PacketId(value))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl From<PacketId> for u16 {
    fn from(id: PacketId) -> Self {
        id.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
