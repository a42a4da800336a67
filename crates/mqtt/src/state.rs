//! Connection state of a device session.
//!
//! The session kernel publishes every transition on a watch channel so that
//! application code can react to connectivity (pause telemetry while offline,
//! show a status indicator, alert when retries are exhausted).
//!
//! # Examples
//!
//! ```ignore
//! use device_mqtt::ConnectionState;
//!
//! let state = ConnectionState::Reconnecting(Duration::from_secs(5));
//! println!("Status: {}", state);  // "Reconnecting (in 5.0 seconds)"
//! println!("Type: {}", state.as_str());  // "Reconnecting"
//! ```

use std::{fmt, time::Duration};

use rumqttc::ConnectReturnCode;

/// Represents the current state of the session's connection.
///
/// The lifecycle flows through these states:
/// - `Disconnected` -> `Connecting` -> `Connected` (successful handshake)
/// - `Connected` -> `Disconnecting` -> `Disconnected(Graceful)` (application disconnect)
/// - `Connected` -> `Disconnected(..)` (abrupt loss, no DISCONNECT sent)
/// - `Disconnected` -> `Reconnecting` -> `Connecting` -> ... (backoff retry loop)
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No transport is bound. Carries the reason the session got here.
    Disconnected(DisconnectReason),

    /// CONNECT sent (or transport being opened), waiting for CONNACK.
    ///
    /// Publishes fail with `NotConnected` in this state.
    Connecting,

    /// CONNACK accepted. The only state in which publishes are accepted.
    Connected,

    /// Application requested a graceful disconnect; DISCONNECT is being sent.
    Disconnecting,

    /// Waiting for the backoff delay before the next reconnect attempt.
    Reconnecting(Duration),
}

impl ConnectionState {
    /// Returns a short string identifier for the current state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Reconnecting(_) => "Reconnecting",
        }
    }

    /// Returns contextual details about the current state.
    ///
    /// For `Disconnected`, the disconnection reason; for `Reconnecting`, the
    /// delay until the next attempt; empty otherwise.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Disconnected(reason) => reason.to_string(),
            ConnectionState::Reconnecting(delay) => {
                format!("in {:.1} seconds", delay.as_secs_f64())
            }
            _ => String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True while a handshake or a scheduled retry is underway.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }

    /// True for a disconnect that needs an explicit `connect()` to recover.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected(
                DisconnectReason::ConnectionLost(_) | DisconnectReason::Graceful
            )
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// Why the session is (or went) `Disconnected`.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// Fresh session, never connected.
    NotYetConnected,
    /// The application called `disconnect()`; DISCONNECT was sent.
    Graceful,
    /// Socket error or the inbound stream ended.
    TransportLost(String),
    /// No PINGRESP before the next keep-alive tick.
    KeepAliveTimeout,
    /// The broker answered CONNECT with a refusal code.
    Refused(ConnectReturnCode),
    /// No CONNACK within the connection timeout.
    HandshakeTimeout,
    /// The connector could not open a fresh binding.
    ConnectFailed(String),
    /// The reconnect policy gave up.
    ConnectionLost(String),
}

impl DisconnectReason {
    /// Whether this disconnect was abrupt from the broker's point of view,
    /// meaning the broker publishes the will if one was armed.
    pub fn is_abrupt(&self) -> bool {
        matches!(
            self,
            DisconnectReason::TransportLost(_) | DisconnectReason::KeepAliveTimeout
        )
    }

    /// Refusals that indicate local misconfiguration; retrying cannot fix them.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Refused(
                ConnectReturnCode::RefusedProtocolVersion
                    | ConnectReturnCode::BadClientId
                    | ConnectReturnCode::BadUserNamePassword
                    | ConnectReturnCode::NotAuthorized
            )
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::NotYetConnected => write!(f, "not yet connected"),
            DisconnectReason::Graceful => write!(f, "disconnected by application"),
            DisconnectReason::TransportLost(cause) => write!(f, "transport lost: {cause}"),
            DisconnectReason::KeepAliveTimeout => write!(f, "keep-alive timeout"),
            DisconnectReason::Refused(code) => write!(f, "refused: {code:?}"),
            DisconnectReason::HandshakeTimeout => write!(f, "handshake timeout"),
            DisconnectReason::ConnectFailed(cause) => write!(f, "connect failed: {cause}"),
            DisconnectReason::ConnectionLost(cause) => write!(f, "connection lost: {cause}"),
        }
    }
}
