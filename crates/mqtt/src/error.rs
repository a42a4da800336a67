//! Error types for the device MQTT session.
//!
//! `TransferError` is what every fallible session call returns. It aggregates
//! configuration mistakes, connect-time failures, local misuse and the
//! per-delivery failures that publish handles resolve with.
//!
//! # Error Categories
//!
//! **Configuration** (fatal to the call, never to the session):
//! - `InvalidQoSLevel`: a raw QoS outside 0, 1 or 2
//! - `ConfigError`: validation failures in settings
//!
//! **Connect time** (the session stays `Disconnected`, no automatic retry):
//! - `ConnectionRefused`: the broker rejected CONNECT with a return code
//! - `HandshakeTimeout`: no CONNACK within the connection timeout
//!
//! **Local preconditions** (session unaffected):
//! - `NotConnected`, `InvalidState`, `InflightLimit`, `NoPacketIdAvailable`
//!
//! **Per delivery** (see [`DeliveryError`]):
//! - `SessionReset`, `Cancelled`, `ConnectionLost`, `Expired`
//!
//! Transient transport failures are deliberately absent from the per-call
//! surface: the session kernel turns them into a reconnect instead.

use std::time::Duration;

use rumqttc::ConnectReturnCode;
use thiserror::Error;

use crate::backoff::BackoffError;

/// Why a tracked publish did not reach its terminal acknowledged state.
///
/// Cloneable because a single reset fans the same reason out to every
/// waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The tracker discarded the delivery because no session state survived
    /// (clean session, broker reported no session, or graceful disconnect).
    #[error("Delivery discarded by session reset")]
    SessionReset,

    /// The caller released its waiter before the broker acknowledged.
    #[error("Delivery wait cancelled by caller")]
    Cancelled,

    /// The reconnect policy gave up; the session needs an explicit connect.
    #[error("Connection lost and reconnect policy exhausted")]
    ConnectionLost,

    /// The delivery was older than the configured delivery timeout when the
    /// session came back, so it was abandoned instead of replayed.
    #[error("Delivery expired before it could be replayed")]
    Expired,
}

/// The unified error type for session operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A QoS value outside the three MQTT levels.
    #[error("Invalid QoS level: {0}, must be 0, 1, or 2")]
    InvalidQoSLevel(u8),

    /// The broker answered CONNECT with a non-success return code.
    #[error("Connection refused by broker: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    /// No CONNACK arrived within the connection timeout.
    #[error("Timed out after {0:?} waiting for CONNACK")]
    HandshakeTimeout(Duration),

    /// Publish attempted while the session is not `Connected`.
    #[error("Session is not connected")]
    NotConnected,

    /// The requested operation is not valid in the current session state.
    #[error("Operation not valid while {0}")]
    InvalidState(&'static str),

    /// `max_inflight` QoS 1/2 deliveries are already pending.
    #[error("In-flight limit of {0} pending deliveries reached")]
    InflightLimit(usize),

    /// Every packet identifier in 1..=65535 is held by a pending delivery.
    #[error("No packet identifier available")]
    NoPacketIdAvailable,

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// Retry policy exhausted (max reconnection attempts or elapsed time).
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] BackoffError),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// Transport I/O failure while opening a binding.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The MQTT codec rejected a packet.
    #[error("Codec error: {0}")]
    Codec(#[from] rumqttc::mqttbytes::Error),

    /// The session kernel task is gone (shut down or panicked).
    #[error("Session kernel stopped")]
    KernelStopped,
}

impl TransferError {
    /// Short, stable label used in disconnect reasons and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::InvalidQoSLevel(_) => "invalid_qos",
            TransferError::ConnectionRefused(_) => "connection_refused",
            TransferError::HandshakeTimeout(_) => "handshake_timeout",
            TransferError::NotConnected => "not_connected",
            TransferError::InvalidState(_) => "invalid_state",
            TransferError::InflightLimit(_) => "inflight_limit",
            TransferError::NoPacketIdAvailable => "no_packet_id",
            TransferError::Delivery(_) => "delivery",
            TransferError::RetriesPolicy(_) => "retries_policy",
            TransferError::ConfigError(_) => "config",
            TransferError::Io(_) => "io",
            TransferError::Codec(_) => "codec",
            TransferError::KernelStopped => "kernel_stopped",
        }
    }
}
