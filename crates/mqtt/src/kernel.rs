//! Session kernel: the task that owns the connection.
//!
//! The kernel is the single writer of everything stateful in a session. It
//! owns the transport binding, the delivery tracker, the reconnect policy and
//! the will lifecycle, and runs one `tokio::select!` loop over:
//!
//! - commands from [`Session`](crate::Session) handles
//! - inbound packets from the current transport
//! - the CONNACK deadline, the reconnect timer and the keep-alive tick
//! - the cancellation token
//!
//! ```text
//! Session handles ──(mpsc Command)──> SessionKernel ──(Packet)──> Transport
//!        ▲                                 │
//!        └──── watch: ConnectionState ─────┤
//!        └──── watch: WillState ───────────┤
//!        └──── broadcast: InboundMessage ──┘
//! ```
//!
//! Timers are plain deadlines checked by the loop, so commands keep being
//! answered while a reconnect is pending.

use std::{collections::HashSet, io, sync::Arc};

use bytes::Bytes;
use rumqttc::{
    ConnAck, Connect, ConnectReturnCode, Login, Packet, PubAck, PubComp, PubRec, PubRel, Publish,
    QoS,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    backoff::{Backoff, RetryDecision},
    config::Config,
    credentials::CredentialSource,
    error::{DeliveryError, TransferError},
    qos::QoSLevel,
    session::InboundMessage,
    state::{ConnectionState, DisconnectReason},
    tracker::{AckOutcome, DeliveryTracker, PublishHandle, Replay},
    transport::{Connector, Transport},
    will::{WillRegistration, WillState},
    Result,
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests sent from session handles to the kernel.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        reply: Reply<()>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoSLevel,
        retain: bool,
        reply: Reply<PublishHandle>,
    },
    Disconnect {
        reply: Reply<()>,
    },
}

/// Channels the kernel reports through.
pub(crate) struct KernelChannels {
    pub commands: mpsc::Receiver<Command>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub will_tx: watch::Sender<WillState>,
    pub messages: broadcast::Sender<InboundMessage>,
    pub cancel: CancellationToken,
}

pub(crate) struct SessionKernel<C: Connector> {
    config: Config,
    connector: C,
    credentials: Option<Arc<dyn CredentialSource>>,
    will: Option<WillRegistration>,

    /// Live binding, present from CONNECT sent until the connection ends.
    link: Option<C::Transport>,
    tracker: DeliveryTracker,
    backoff: Backoff,

    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    will_tx: watch::Sender<WillState>,
    messages: broadcast::Sender<InboundMessage>,
    cancel: CancellationToken,

    /// Caller of an explicit `connect()` waiting for the handshake outcome.
    /// `None` during automatic reconnects.
    pending_connect: Option<Reply<()>>,
    handshake_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    keep_alive_at: Option<Instant>,
    awaiting_pingresp: bool,

    /// Inbound QoS 2 packet ids delivered but not yet released by PUBREL.
    inbound_qos2: HashSet<u16>,
}

impl<C: Connector> SessionKernel<C> {
    pub(crate) fn new(
        config: Config,
        connector: C,
        credentials: Option<Arc<dyn CredentialSource>>,
        will: Option<WillRegistration>,
        channels: KernelChannels,
    ) -> Self {
        let tracker = DeliveryTracker::new(usize::from(config.max_inflight));
        let backoff = Backoff::from_config(&config.reconnect);
        Self {
            config,
            connector,
            credentials,
            will,
            link: None,
            tracker,
            backoff,
            commands: channels.commands,
            state_tx: channels.state_tx,
            will_tx: channels.will_tx,
            messages: channels.messages,
            cancel: channels.cancel,
            pending_connect: None,
            handshake_deadline: None,
            retry_at: None,
            keep_alive_at: None,
            awaiting_pingresp: false,
            inbound_qos2: HashSet::new(),
        }
    }

    /// Runs until cancelled or until every session handle is dropped.
    pub(crate) async fn run(mut self) {
        info!(client_id = %self.config.client_id, "Session kernel started");
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, closing session...");
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        break;
                    }
                },

                inbound = next_inbound(&mut self.link) => self.handle_inbound(inbound).await,

                _ = sleep_until(self.handshake_deadline) => self.on_handshake_timeout(),

                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    info!(attempt = self.backoff.attempt(), "Attempting reconnect");
                    self.begin_connect(None).await;
                }

                _ = sleep_until(self.keep_alive_at) => self.on_keep_alive_tick().await,
            }
        }
        self.shutdown().await;
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Publishes a state transition to every watcher.
    fn update_state(&self, state: ConnectionState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            info!("Connection state changed to: {}", state);
            self.state_tx.send_replace(state);
        }
    }

    fn update_will(&self, state: WillState) {
        if self.will.is_none() {
            return;
        }
        let previous = self.will_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Will state changed");
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => match self.state() {
                ConnectionState::Disconnected(_) => self.begin_connect(Some(reply)).await,
                other => {
                    let _ = reply.send(Err(TransferError::InvalidState(other.as_str())));
                }
            },
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                reply,
            } => {
                let result = self.publish(topic, payload, qos, retain).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
        }
    }

    /// Opens a fresh transport and sends CONNECT. The handshake finishes when
    /// CONNACK arrives or the deadline fires.
    async fn begin_connect(&mut self, reply: Option<Reply<()>>) {
        self.pending_connect = reply;
        self.update_state(ConnectionState::Connecting);

        let timeout = self.config.connection_timeout();
        let deadline = Instant::now() + timeout;

        let opened = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                // The run loop sees the token next and shuts down.
                debug!("Transport open abandoned by shutdown");
                return;
            }
            opened = time::timeout_at(deadline, self.connector.connect()) => opened,
        };

        let mut transport = match opened {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!("Failed to open transport: {}", e);
                let reason = DisconnectReason::ConnectFailed(e.to_string());
                return self.connect_failed(reason, TransferError::Io(e));
            }
            Err(_) => {
                warn!("Timed out opening transport after {:?}", timeout);
                return self.connect_failed(
                    DisconnectReason::HandshakeTimeout,
                    TransferError::HandshakeTimeout(timeout),
                );
            }
        };

        let connect = self.connect_packet();
        debug!(
            client_id = %connect.client_id,
            clean_session = connect.clean_session,
            keep_alive = connect.keep_alive,
            will = connect.last_will.is_some(),
            "Sending CONNECT"
        );
        if let Err(e) = transport.send(Packet::Connect(connect)).await {
            warn!("Failed to send CONNECT: {}", e);
            let reason = DisconnectReason::ConnectFailed(e.to_string());
            return self.connect_failed(reason, TransferError::Io(e));
        }

        self.link = Some(transport);
        self.handshake_deadline = Some(deadline);
    }

    fn connect_packet(&self) -> Connect {
        let mut connect = Connect::new(self.config.client_id.clone());
        connect.keep_alive = u16::try_from(self.config.keep_alive).unwrap_or(u16::MAX);
        connect.clean_session = self.config.clean_session;
        connect.last_will = self.will.as_ref().map(WillRegistration::to_last_will);
        connect.login = self
            .credentials
            .as_ref()
            .and_then(|source| source.resolve())
            .map(|creds| Login::new(creds.username, creds.password));
        connect
    }

    /// A connect attempt ended without a session.
    ///
    /// An explicit `connect()` reports the error to its caller and stays
    /// `Disconnected`; an automatic reconnect asks the policy again.
    fn connect_failed(&mut self, reason: DisconnectReason, err: TransferError) {
        self.link = None;
        self.handshake_deadline = None;

        match self.pending_connect.take() {
            Some(reply) => {
                self.update_state(ConnectionState::Disconnected(reason));
                let _ = reply.send(Err(err));
            }
            None => {
                debug!(error = %err, "Reconnect attempt failed");
                self.update_state(ConnectionState::Disconnected(reason.clone()));
                self.schedule_retry(reason);
            }
        }
    }

    fn on_handshake_timeout(&mut self) {
        let timeout = self.config.connection_timeout();
        warn!("No CONNACK within {:?}", timeout);
        self.connect_failed(
            DisconnectReason::HandshakeTimeout,
            TransferError::HandshakeTimeout(timeout),
        );
    }

    async fn on_connack(&mut self, ack: ConnAck) {
        if self.handshake_deadline.take().is_none() {
            warn!("Ignoring CONNACK outside of a handshake");
            return;
        }

        if ack.code != ConnectReturnCode::Success {
            error!("Connection refused by broker: {:?}", ack.code);
            return self.connect_failed(
                DisconnectReason::Refused(ack.code),
                TransferError::ConnectionRefused(ack.code),
            );
        }

        let resumed = !self.config.clean_session && ack.session_present;
        info!(
            session_present = ack.session_present,
            resumed, "Connection established successfully."
        );

        self.backoff.reset();
        if !resumed {
            self.inbound_qos2.clear();
            let discarded = self.tracker.reset();
            if discarded > 0 {
                warn!(discarded, "Broker holds no session, pending deliveries reset");
            }
        }

        self.update_state(ConnectionState::Connected);
        self.update_will(WillState::Armed);
        self.arm_keep_alive();
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Ok(()));
        }

        if resumed {
            self.replay().await;
        }
    }

    /// Re-sends unresolved deliveries after a resumed session.
    async fn replay(&mut self) {
        let now = Instant::now();
        if let Some(max_age) = self.config.delivery_timeout() {
            self.tracker.expire(now, max_age);
        }

        let replays = self.tracker.replay_pending(now);
        if !replays.is_empty() {
            info!(count = replays.len(), "Replaying pending deliveries");
        }
        for replay in replays {
            let packet = match replay {
                Replay::Publish(publish) => Packet::Publish(publish),
                Replay::Release(release) => Packet::PubRel(release),
            };
            if !self.send(packet).await {
                break;
            }
        }
    }

    async fn publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoSLevel,
        retain: bool,
    ) -> Result<PublishHandle> {
        if !self.state().is_connected() {
            return Err(TransferError::NotConnected);
        }

        if !qos.is_tracked() {
            let mut publish = Publish::from_bytes(topic, QoS::AtMostOnce, payload);
            publish.retain = retain;
            // Untracked, so a failed write is the caller's only signal.
            if !self.send(Packet::Publish(publish)).await {
                return Err(TransferError::NotConnected);
            }
            return Ok(PublishHandle::resolved(qos));
        }

        let (publish, handle) = self.tracker.submit(topic, payload, qos, retain)?;
        trace!(packet_id = publish.pkid, topic = %publish.topic, "Sending PUBLISH");
        // A failed write leaves the delivery tracked for replay.
        self.send(Packet::Publish(publish)).await;
        Ok(handle)
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => {
                self.update_state(ConnectionState::Disconnecting);
                if !self.send(Packet::Disconnect).await {
                    warn!("Error sending DISCONNECT, closing anyway");
                }
                self.update_will(WillState::Discharged);
                self.close(DisconnectReason::Graceful);
                Ok(())
            }
            ConnectionState::Reconnecting(_) => {
                info!("Reconnect cancelled by disconnect");
                self.retry_at = None;
                self.close(DisconnectReason::Graceful);
                Ok(())
            }
            other => Err(TransferError::InvalidState(other.as_str())),
        }
    }

    /// Ends the session on our side: pending deliveries are released and the
    /// retry policy starts fresh for the next explicit connect.
    fn close(&mut self, reason: DisconnectReason) {
        self.drop_link();
        self.tracker.reset();
        self.inbound_qos2.clear();
        self.backoff.reset();
        self.update_state(ConnectionState::Disconnected(reason));
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.handshake_deadline = None;
        self.keep_alive_at = None;
        self.awaiting_pingresp = false;
    }

    /// Writes a packet to the live link. On failure the link is treated as
    /// lost and `false` is returned.
    async fn send(&mut self, packet: Packet) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match link.send(packet).await {
            Ok(()) => true,
            Err(e) => {
                self.on_link_lost(e.to_string());
                false
            }
        }
    }

    async fn handle_inbound(&mut self, inbound: Option<io::Result<Packet>>) {
        match inbound {
            Some(Ok(packet)) => self.handle_packet(packet).await,
            Some(Err(e)) => self.on_link_lost(e.to_string()),
            None => self.on_link_lost("connection closed by peer".to_string()),
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::ConnAck(ack) => self.on_connack(ack).await,
            Packet::PubAck(ack) => {
                self.tracker.on_acknowledge(ack.pkid);
            }
            Packet::PubRec(rec) => {
                if self.tracker.on_received(rec.pkid) == AckOutcome::Advanced {
                    self.send(Packet::PubRel(PubRel::new(rec.pkid))).await;
                }
            }
            Packet::PubComp(comp) => {
                self.tracker.on_complete(comp.pkid);
            }
            Packet::PingResp => {
                trace!("PINGRESP received");
                self.awaiting_pingresp = false;
            }
            Packet::Publish(publish) => self.on_inbound_publish(publish).await,
            Packet::PubRel(rel) => {
                self.inbound_qos2.remove(&rel.pkid);
                self.send(Packet::PubComp(PubComp::new(rel.pkid))).await;
            }
            Packet::Disconnect => {
                warn!("Disconnected by broker");
                self.on_link_lost("broker sent DISCONNECT".to_string());
            }
            other => debug!("Ignoring unexpected packet: {:?}", other),
        }
    }

    async fn on_inbound_publish(&mut self, publish: Publish) {
        let pkid = publish.pkid;
        let qos = QoSLevel::from(publish.qos);
        trace!(topic = %publish.topic, %qos, pkid, "Received publish");

        match qos {
            QoSLevel::AtMostOnce => self.deliver(publish),
            QoSLevel::AtLeastOnce => {
                self.deliver(publish);
                self.send(Packet::PubAck(PubAck::new(pkid))).await;
            }
            QoSLevel::ExactlyOnce => {
                if self.inbound_qos2.insert(pkid) {
                    self.deliver(publish);
                } else {
                    debug!(pkid, "Duplicate QoS 2 publish, not delivered again");
                }
                self.send(Packet::PubRec(PubRec::new(pkid))).await;
            }
        }
    }

    fn deliver(&self, publish: Publish) {
        let message = InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: QoSLevel::from(publish.qos),
            retain: publish.retain,
        };
        if self.messages.send(message).is_err() {
            trace!("No subscribers for inbound messages");
        }
    }

    fn arm_keep_alive(&mut self) {
        self.awaiting_pingresp = false;
        let interval = self.config.keep_alive();
        self.keep_alive_at = (!interval.is_zero()).then(|| Instant::now() + interval);
    }

    async fn on_keep_alive_tick(&mut self) {
        if self.awaiting_pingresp {
            warn!("No PINGRESP within keep-alive interval");
            self.lose_connection(DisconnectReason::KeepAliveTimeout);
            return;
        }
        self.awaiting_pingresp = true;
        self.keep_alive_at = Some(Instant::now() + self.config.keep_alive());
        trace!("Sending PINGREQ");
        self.send(Packet::PingReq).await;
    }

    /// The transport failed or closed. What that means depends on where the
    /// session was.
    fn on_link_lost(&mut self, cause: String) {
        match self.state() {
            ConnectionState::Connected => {
                self.lose_connection(DisconnectReason::TransportLost(cause))
            }
            ConnectionState::Connecting => {
                warn!("Transport closed during handshake: {}", cause);
                let err = TransferError::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    cause.clone(),
                ));
                self.connect_failed(DisconnectReason::ConnectFailed(cause), err);
            }
            _ => self.drop_link(),
        }
    }

    /// Abrupt loss of a live connection. No DISCONNECT is sent, so the broker
    /// publishes the will.
    fn lose_connection(&mut self, reason: DisconnectReason) {
        warn!("Connection lost: {}", reason);
        self.drop_link();
        if reason.is_abrupt() {
            self.update_will(WillState::Triggered);
        }
        self.update_state(ConnectionState::Disconnected(reason.clone()));
        self.schedule_retry(reason);
    }

    fn schedule_retry(&mut self, reason: DisconnectReason) {
        match self.backoff.decide(&reason) {
            RetryDecision::Retry(delay) => {
                info!(
                    "Reconnecting in {:.2} seconds due to: {}",
                    delay.as_secs_f64(),
                    reason
                );
                self.retry_at = Some(Instant::now() + delay);
                self.update_state(ConnectionState::Reconnecting(delay));
            }
            RetryDecision::GiveUp(err) => {
                error!("Giving up on reconnect: {}", err);
                self.retry_at = None;
                self.tracker.fail_all(DeliveryError::ConnectionLost);
                self.inbound_qos2.clear();
                self.backoff.reset();
                self.update_state(ConnectionState::Disconnected(
                    DisconnectReason::ConnectionLost(err.to_string()),
                ));
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state().is_connected() {
            self.update_state(ConnectionState::Disconnecting);
            if !self.send(Packet::Disconnect).await {
                warn!("Error sending DISCONNECT during shutdown");
            }
            self.update_will(WillState::Discharged);
        }
        self.retry_at = None;
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(TransferError::KernelStopped));
        }
        self.close(DisconnectReason::Graceful);
        info!("Session kernel shutdown completed");
    }
}

/// Next packet from the link, or never when there is none.
async fn next_inbound<T: Transport>(link: &mut Option<T>) -> Option<io::Result<Packet>> {
    match link {
        Some(transport) => transport.next_packet().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
