//! Application-facing session handle.
//!
//! [`SessionBuilder`] validates the configuration and spawns the session
//! kernel on the current tokio runtime. The returned [`Session`] is a cheap,
//! cloneable handle: every call becomes a command for the kernel task, and
//! connectivity, will lifecycle and inbound messages are observed through
//! channels.
//!
//! # Examples
//!
//! ```ignore
//! use device_mqtt::{Config, QoSLevel, SessionBuilder, TcpConnector};
//!
//! let config = Config::default();
//! let connector = TcpConnector::from_config(&config);
//! let session = SessionBuilder::new(config).spawn(connector)?;
//!
//! session.connect().await?;
//! let handle = session.publish("devices/d1/telemetry", "21.5", QoSLevel::AtLeastOnce, false).await?;
//! handle.await?;
//! session.disconnect().await?;
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use validator::Validate;

use crate::{
    config::Config,
    credentials::{CredentialSource, Credentials},
    error::TransferError,
    kernel::{Command, KernelChannels, SessionKernel},
    qos::QoSLevel,
    state::{ConnectionState, DisconnectReason},
    tracker::PublishHandle,
    transport::Connector,
    will::{WillRegistration, WillState},
    Result,
};

/// Capacity of the inbound message broadcast; slow subscribers lag.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// A message the broker delivered to this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoSLevel,
    pub retain: bool,
}

/// Builds and spawns a session.
pub struct SessionBuilder {
    config: Config,
    will: Option<WillRegistration>,
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl SessionBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            will: None,
            credentials: None,
        }
    }

    /// Overrides the `will` section of the configuration.
    pub fn with_will(mut self, will: WillRegistration) -> Self {
        self.will = Some(will);
        self
    }

    /// Overrides the `credentials` section of the configuration.
    pub fn with_credentials(mut self, source: impl CredentialSource + 'static) -> Self {
        self.credentials = Some(Arc::new(source));
        self
    }

    /// Validates the configuration and spawns the kernel task.
    ///
    /// Must be called from within a tokio runtime. The session starts
    /// `Disconnected`; nothing touches the network until [`Session::connect`].
    ///
    /// # Errors
    /// - `ConfigError` when validation fails
    /// - `InvalidQoSLevel` when the configured will has a bad QoS
    pub fn spawn<C: Connector>(self, connector: C) -> Result<Session> {
        self.config.validate()?;

        let will = match self.will {
            Some(will) => Some(will),
            None => self
                .config
                .will
                .as_ref()
                .map(WillRegistration::try_from)
                .transpose()?,
        };
        let credentials = self.credentials.or_else(|| {
            self.config
                .credentials
                .as_ref()
                .map(|c| Arc::new(Credentials::from(c)) as Arc<dyn CredentialSource>)
        });

        let (command_tx, command_rx) = mpsc::channel(self.config.command_channel_capacity);
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected(DisconnectReason::NotYetConnected));
        let initial_will = if will.is_some() {
            WillState::Registered
        } else {
            WillState::Unregistered
        };
        let (will_tx, will_rx) = watch::channel(initial_will);
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let client_id: Arc<str> = Arc::from(self.config.client_id.as_str());
        debug!(client_id = %client_id, will = will.is_some(), "Spawning session kernel");

        let kernel = SessionKernel::new(
            self.config,
            connector,
            credentials,
            will,
            KernelChannels {
                commands: command_rx,
                state_tx,
                will_tx,
                messages: messages.clone(),
                cancel: cancel.clone(),
            },
        );
        tokio::spawn(kernel.run());

        Ok(Session {
            client_id,
            commands: command_tx,
            state_rx,
            will_rx,
            messages,
            cancel,
        })
    }
}

/// Handle to a running session.
///
/// Clones share the same kernel. The kernel stops when [`Session::shutdown`]
/// is called or when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    client_id: Arc<str>,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    will_rx: watch::Receiver<WillState>,
    messages: broadcast::Sender<InboundMessage>,
    cancel: CancellationToken,
}

impl Session {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connects to the broker and waits for the handshake to finish.
    ///
    /// # Errors
    /// - `InvalidState` unless the session is `Disconnected`
    /// - `ConnectionRefused` when the broker rejects CONNECT
    /// - `HandshakeTimeout` when no CONNACK arrives in time
    /// - `Io` when the transport cannot be opened
    ///
    /// Failures here are never retried automatically.
    pub async fn connect(&self) -> Result<()> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// Publishes a message.
    ///
    /// Returns once the PUBLISH has been handed to the transport. The handle
    /// resolves when the broker finishes the QoS handshake (immediately for
    /// QoS 0).
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoSLevel,
        retain: bool,
    ) -> Result<PublishHandle> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|reply| Command::Publish {
            topic,
            payload,
            qos,
            retain,
            reply,
        })
        .await
    }

    /// Sends DISCONNECT and releases pending deliveries.
    ///
    /// Also cancels a pending reconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn will_state(&self) -> WillState {
        *self.will_rx.borrow()
    }

    pub fn subscribe_will(&self) -> watch::Receiver<WillState> {
        self.will_rx.clone()
    }

    /// Messages the broker delivers to this device from now on.
    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    /// Stops the kernel, disconnecting gracefully when connected.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| TransferError::KernelStopped)?;
        rx.await.map_err(|_| TransferError::KernelStopped)?
    }
}
