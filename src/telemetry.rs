//! Periodic telemetry publishing over a device session.
//!
//! `TelemetryAgent` brings the session up (retrying the initial connect
//! itself, since the session only retries connections it already had), then
//! publishes a JSON reading every interval while connected. Delivery
//! outcomes are logged from detached tasks so a slow broker never delays the
//! next sample.

use std::time::Duration;

use device_mqtt::{
    backoff::Backoff, ConnectionState, InboundMessage, QoSLevel, ReconnectConfig, Session,
    TransferError, WillState,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{
    sync::{broadcast, watch},
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::config::TelemetryConfig;

/// One telemetry sample as published on the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub sequence: u64,
    /// Seconds since the agent started.
    pub uptime_secs: u64,
    /// Unix timestamp of the sample.
    pub timestamp: i64,
}

pub struct TelemetryAgent {
    session: Session,
    config: TelemetryConfig,
    qos: QoSLevel,
    retry: Backoff,
    started: Instant,
    sequence: u64,
}

impl TelemetryAgent {
    /// # Errors
    /// `InvalidQoSLevel` when the configured QoS is not 0, 1 or 2.
    pub fn new(
        session: Session,
        config: TelemetryConfig,
        reconnect: &ReconnectConfig,
    ) -> Result<Self, TransferError> {
        let qos = QoSLevel::try_from(config.qos)?;
        Ok(Self {
            session,
            config,
            qos,
            retry: Backoff::from_config(reconnect),
            started: Instant::now(),
            sequence: 0,
        })
    }

    /// Connects, then publishes until the session gives up for good.
    pub async fn run(mut self) -> Result<(), TransferError> {
        self.connect().await?;

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut state_rx = self.session.subscribe_state();

        loop {
            ticker.tick().await;

            let state = state_rx.borrow_and_update().clone();
            match &state {
                ConnectionState::Connected => self.publish_reading().await,
                ConnectionState::Disconnected(reason) if state.is_terminal() => {
                    error!("Session is down for good: {}", reason);
                    // Start over as on boot.
                    self.connect().await?;
                }
                other => debug!("Skipping sample while {}", other),
            }
        }
    }

    /// Initial connect with the agent's own backoff.
    async fn connect(&mut self) -> Result<(), TransferError> {
        self.retry.reset();
        loop {
            match self.session.connect().await {
                Ok(()) => {
                    info!(client_id = self.session.client_id(), "Session connected");
                    return Ok(());
                }
                Err(TransferError::KernelStopped) => return Err(TransferError::KernelStopped),
                Err(e) => {
                    let delay = self.retry.next_sleep()?;
                    warn!(
                        "Connect failed ({}), retrying in {:.2} seconds",
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn next_reading(&mut self) -> Reading {
        self.sequence += 1;
        Reading {
            device_id: self.session.client_id().to_string(),
            sequence: self.sequence,
            uptime_secs: self.started.elapsed().as_secs(),
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    async fn publish_reading(&mut self) {
        let reading = self.next_reading();
        let payload = match serde_json::to_vec(&reading) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize reading: {}", e);
                return;
            }
        };

        let handle = match self
            .session
            .publish(self.config.topic.clone(), payload, self.qos, self.config.retain)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(sequence = reading.sequence, "Publish rejected: {}", e);
                return;
            }
        };

        let sequence = reading.sequence;
        tokio::spawn(async move {
            match handle.await {
                Ok(receipt) => debug!(
                    sequence,
                    attempts = receipt.attempts,
                    "Reading delivered"
                ),
                Err(e) => warn!(sequence, "Reading not delivered: {}", e),
            }
        });
    }
}

/// Logs every connectivity change until the session goes away.
pub async fn log_state_changes(mut state_rx: watch::Receiver<ConnectionState>) {
    while state_rx.changed().await.is_ok() {
        let state = state_rx.borrow_and_update().clone();
        match &state {
            ConnectionState::Connected => info!("Device online"),
            ConnectionState::Disconnected(reason) if state.is_terminal() => {
                warn!("Device offline: {}", reason)
            }
            other => debug!("Connection: {}", other),
        }
    }
    debug!("ConnectionState channel closed, listening stopped");
}

/// Logs will lifecycle changes; `Triggered` means the broker announced us offline.
pub async fn log_will_changes(mut will_rx: watch::Receiver<WillState>) {
    while will_rx.changed().await.is_ok() {
        let will = *will_rx.borrow_and_update();
        if will.should_fire() {
            warn!("Connection dropped abruptly, broker will publish the last will");
        } else {
            debug!("Will state: {}", will);
        }
    }
}

/// Logs cloud-to-device messages.
pub async fn log_commands(mut messages: broadcast::Receiver<InboundMessage>) {
    loop {
        match messages.recv().await {
            Ok(message) => info!(
                topic = %message.topic,
                qos = %message.qos,
                bytes = message.payload.len(),
                "Command received"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Command listener lagging")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
