//! # device-mqtt: device-side MQTT session core
//!
//! Keeps a single persistent MQTT 3.1.1 session per device identity and
//! makes sure published telemetry is either acknowledged by the broker or
//! reported back as failed. On top of the `rumqttc` packet codec this crate
//! adds:
//!
//! - **Session state machine** with observable connectivity status
//! - **QoS 1 / QoS 2 delivery tracking** with per-publish completion handles
//! - **Reconnect policy** with exponential backoff, jitter and limits
//! - **Replay** of unacknowledged deliveries when the broker resumes a session
//! - **Last-will lifecycle**: registered at connect, discharged by a graceful
//!   disconnect, triggered by an abrupt loss
//!
//! # Quick Start
//!
//! ```ignore
//! use device_mqtt::{Config, QoSLevel, SessionBuilder, TcpConnector, WillRegistration};
//!
//! #[tokio::main]
//! async fn main() -> device_mqtt::Result<()> {
//!     let config = Config {
//!         client_id: "sensor-0042".into(),
//!         host: "hub.example.net".into(),
//!         ..Default::default()
//!     };
//!     let will = WillRegistration::new(1, "devices/sensor-0042/status", "offline", true)?;
//!
//!     let session = SessionBuilder::new(config.clone())
//!         .with_will(will)
//!         .spawn(TcpConnector::from_config(&config))?;
//!
//!     session.connect().await?;
//!     let handle = session
//!         .publish("devices/sensor-0042/telemetry", "21.5", QoSLevel::AtLeastOnce, false)
//!         .await?;
//!     handle.await?;
//!
//!     session.disconnect().await
//! }
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──(CONNACK)──> Connected
//!      ▲                          │                        │
//!      │                   (refused/timeout)         (transport lost)
//!      │                          │                        │
//!      │                          ▼                        ▼
//!      └────────────────── Disconnected <─────── Reconnecting(delay)
//!                                                  (policy gave up)
//! ```
//!
//! A failed explicit `connect()` is reported to the caller and never retried.
//! Only the loss of an established connection starts the reconnect loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     Session (cloneable handle)       │
//! └────────────┬─────────────────────────┘
//!              │ commands / watch / broadcast
//! ┌────────────▼─────────────────────────┐
//! │     SessionKernel (one tokio task)   │
//! │ DeliveryTracker, Backoff, WillState  │
//! └────────────┬─────────────────────────┘
//!              │ Packet
//! ┌────────────▼─────────────────────────┐
//! │     Transport / Connector            │
//! │ TcpConnector or a test double        │
//! └──────────────────────────────────────┘
//! ```

// Module declarations
pub mod backoff;
pub mod config;
pub mod credentials;
pub mod error;
mod kernel;
pub mod qos;
pub mod session;
pub mod state;
pub mod tracker;
pub mod transport;
pub mod will;

// Re-exports: Configuration
pub use config::{Config, CredentialsConfig, ReconnectConfig, WillConfig};
pub use credentials::{CredentialSource, Credentials};
// Re-exports: Error handling
//
// Every session call returns TransferError; publish handles resolve with DeliveryError
pub use error::{DeliveryError, TransferError};
pub use qos::{PacketId, QoSLevel};
// Re-exports: Session entry points
pub use session::{InboundMessage, Session, SessionBuilder};
// Re-exports: State monitoring
pub use state::{ConnectionState, DisconnectReason};
pub use tracker::{DeliveryReceipt, PublishHandle};
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};
pub use will::{WillRegistration, WillState};

// Lower-level building blocks, re-exported for callers that drive packets
// through their own `Transport`.
pub use rumqttc::{ConnAck, ConnectReturnCode, Packet};

/// Result type for session operations.
///
/// An alias for `std::result::Result<T, TransferError>`.
pub type Result<T> = std::result::Result<T, TransferError>;
