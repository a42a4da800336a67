//! QoS-aware delivery tracker.
//!
//! Every QoS 1 and QoS 2 publish gets a packet identifier and an entry here
//! until the broker finishes the acknowledgment handshake for it:
//!
//! ```text
//! QoS 1:  Sent ──(PUBACK)──> Acknowledged
//! QoS 2:  Sent ──(PUBREC)──> Received ──(PUBCOMP)──> Completed
//! ```
//!
//! Reaching a terminal state removes the entry, frees its identifier and
//! resolves the caller's [`PublishHandle`]. The session kernel is the only
//! owner of the tracker; nothing here is shared across tasks except the
//! oneshot channel behind each handle.

use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use rumqttc::{PubRel, Publish, QoS};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, trace, warn};

use crate::{
    error::{DeliveryError, TransferError},
    qos::{PacketId, QoSLevel},
};

type DeliveryResult = Result<DeliveryReceipt, DeliveryError>;

/// QoS 1 handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos1State {
    Sent,
    Acknowledged,
}

/// QoS 2 handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    Sent,
    Received,
    Completed,
}

/// Handshake progress of a tracked delivery, keyed by its QoS.
///
/// QoS 0 is never tracked, so it has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    AtLeastOnce(Qos1State),
    ExactlyOnce(Qos2State),
}

impl DeliveryState {
    /// Initial state for a new delivery; `None` for QoS 0.
    pub fn sent(qos: QoSLevel) -> Option<Self> {
        match qos {
            QoSLevel::AtMostOnce => None,
            QoSLevel::AtLeastOnce => Some(DeliveryState::AtLeastOnce(Qos1State::Sent)),
            QoSLevel::ExactlyOnce => Some(DeliveryState::ExactlyOnce(Qos2State::Sent)),
        }
    }

    pub fn qos(self) -> QoSLevel {
        match self {
            DeliveryState::AtLeastOnce(_) => QoSLevel::AtLeastOnce,
            DeliveryState::ExactlyOnce(_) => QoSLevel::ExactlyOnce,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::AtLeastOnce(Qos1State::Acknowledged)
                | DeliveryState::ExactlyOnce(Qos2State::Completed)
        )
    }
}

/// Successful outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// `None` for QoS 0, which never gets an identifier.
    pub packet_id: Option<PacketId>,
    pub qos: QoSLevel,
    /// Number of times the PUBLISH (or PUBREL) went on the wire.
    pub attempts: u32,
}

/// Caller's side of a publish.
///
/// Await it (it implements `Future`) or call [`PublishHandle::wait`] to learn
/// how the delivery ended. Dropping or cancelling the handle only stops
/// waiting; the delivery itself keeps going until the broker acknowledges it.
#[derive(Debug)]
pub struct PublishHandle {
    packet_id: Option<PacketId>,
    qos: QoSLevel,
    rx: oneshot::Receiver<DeliveryResult>,
}

impl PublishHandle {
    /// Handle for a QoS 0 publish, resolved as soon as it is written.
    pub(crate) fn resolved(qos: QoSLevel) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(DeliveryReceipt {
            packet_id: None,
            qos,
            attempts: 1,
        }));
        Self {
            packet_id: None,
            qos,
            rx,
        }
    }

    pub fn packet_id(&self) -> Option<PacketId> {
        self.packet_id
    }

    pub fn qos(&self) -> QoSLevel {
        self.qos
    }

    /// Waits until the delivery reaches a terminal state.
    pub async fn wait(self) -> DeliveryResult {
        self.await
    }

    /// Stops waiting.
    ///
    /// Returns the outcome if it already arrived, `Err(Cancelled)` otherwise.
    /// The tracker keeps the entry, so a later acknowledgment still frees the
    /// packet identifier.
    pub fn cancel(mut self) -> DeliveryResult {
        self.rx.close();
        match self.rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Cancelled),
        }
    }
}

impl Future for PublishHandle {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the kernel went away mid-delivery.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(DeliveryError::ConnectionLost)))
    }
}

/// One unresolved QoS 1 or QoS 2 publish.
#[derive(Debug)]
pub struct PendingDelivery {
    packet_id: PacketId,
    topic: String,
    payload: Bytes,
    retain: bool,
    state: DeliveryState,
    attempts: u32,
    last_sent_at: Instant,
    waiter: Option<oneshot::Sender<DeliveryResult>>,
}

impl PendingDelivery {
    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    pub fn qos(&self) -> QoSLevel {
        self.state.qos()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_sent_at(&self) -> Instant {
        self.last_sent_at
    }

    fn to_publish(&self, dup: bool) -> Publish {
        let mut publish = Publish::from_bytes(
            self.topic.clone(),
            QoS::from(self.qos()),
            self.payload.clone(),
        );
        publish.pkid = self.packet_id.get();
        publish.retain = self.retain;
        publish.dup = dup;
        publish
    }

    fn resolve(mut self, result: DeliveryResult) {
        if let Some(waiter) = self.waiter.take() {
            // The receiver is gone when the caller cancelled; nothing to report.
            let _ = waiter.send(result);
        }
    }

    fn receipt(&self) -> DeliveryReceipt {
        DeliveryReceipt {
            packet_id: Some(self.packet_id),
            qos: self.qos(),
            attempts: self.attempts,
        }
    }
}

/// Result of feeding an acknowledgment to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// QoS 2 moved to `Received`; the kernel owes the broker a PUBREL.
    Advanced,
    /// The delivery is terminal and its handle was resolved.
    Completed,
    /// Unknown id, wrong QoS or out-of-order; nothing changed.
    Ignored,
}

/// A packet to re-send after a resumed session.
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    /// Full PUBLISH with the DUP flag set.
    Publish(Publish),
    /// QoS 2 delivery the broker already received; only the release step.
    Release(PubRel),
}

impl Replay {
    pub fn packet_id(&self) -> u16 {
        match self {
            Replay::Publish(publish) => publish.pkid,
            Replay::Release(release) => release.pkid,
        }
    }
}

/// Tracks unacknowledged deliveries keyed by packet identifier.
#[derive(Debug)]
pub struct DeliveryTracker {
    pending: BTreeMap<u16, PendingDelivery>,
    next_id: u16,
    max_inflight: usize,
}

impl DeliveryTracker {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next_id: 1,
            max_inflight,
        }
    }

    /// Registers a new QoS 1 or QoS 2 delivery.
    ///
    /// Returns the first PUBLISH to put on the wire and the caller's handle.
    ///
    /// # Errors
    /// - `InvalidState` for QoS 0, which is never tracked
    /// - `InflightLimit` when `max_inflight` deliveries are already pending
    /// - `NoPacketIdAvailable` when every identifier is taken
    pub fn submit(
        &mut self,
        topic: impl Into<String>,
        payload: Bytes,
        qos: QoSLevel,
        retain: bool,
    ) -> Result<(Publish, PublishHandle), TransferError> {
        let Some(state) = DeliveryState::sent(qos) else {
            return Err(TransferError::InvalidState("publishing untracked QoS 0"));
        };
        if self.pending.len() >= self.max_inflight {
            return Err(TransferError::InflightLimit(self.max_inflight));
        }
        let packet_id = self
            .allocate_id()
            .ok_or(TransferError::NoPacketIdAvailable)?;

        let (tx, rx) = oneshot::channel();
        let delivery = PendingDelivery {
            packet_id,
            topic: topic.into(),
            payload,
            retain,
            state,
            attempts: 1,
            last_sent_at: Instant::now(),
            waiter: Some(tx),
        };
        let publish = delivery.to_publish(false);
        trace!(packet_id = %packet_id, qos = %qos, topic = %delivery.topic, "Tracking delivery");
        self.pending.insert(packet_id.get(), delivery);

        Ok((
            publish,
            PublishHandle {
                packet_id: Some(packet_id),
                qos,
                rx,
            },
        ))
    }

    /// Next free identifier after the last one handed out, wrapping past
    /// 65535 back to 1.
    fn allocate_id(&mut self) -> Option<PacketId> {
        for _ in 0..u16::MAX {
            let candidate = self.next_id;
            self.next_id = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if !self.pending.contains_key(&candidate) {
                return PacketId::new(candidate);
            }
        }
        None
    }

    /// PUBACK for a QoS 1 delivery.
    pub fn on_acknowledge(&mut self, packet_id: u16) -> AckOutcome {
        match self.pending.get(&packet_id) {
            Some(d) if d.state == DeliveryState::AtLeastOnce(Qos1State::Sent) => {
                self.finish(packet_id, DeliveryState::AtLeastOnce(Qos1State::Acknowledged))
            }
            Some(d) => {
                warn!(packet_id, state = ?d.state, "Ignoring unexpected PUBACK");
                AckOutcome::Ignored
            }
            None => {
                warn!(packet_id, "Ignoring PUBACK for unknown packet id");
                AckOutcome::Ignored
            }
        }
    }

    /// PUBREC for a QoS 2 delivery. A repeated PUBREC is answered again.
    pub fn on_received(&mut self, packet_id: u16) -> AckOutcome {
        let Some(delivery) = self.pending.get_mut(&packet_id) else {
            warn!(packet_id, "Ignoring PUBREC for unknown packet id");
            return AckOutcome::Ignored;
        };
        match delivery.state {
            DeliveryState::ExactlyOnce(Qos2State::Sent) => {
                delivery.state = DeliveryState::ExactlyOnce(Qos2State::Received);
                trace!(packet_id, "Delivery received by broker");
                AckOutcome::Advanced
            }
            DeliveryState::ExactlyOnce(Qos2State::Received) => {
                debug!(packet_id, "Duplicate PUBREC");
                AckOutcome::Advanced
            }
            DeliveryState::ExactlyOnce(Qos2State::Completed) => AckOutcome::Ignored,
            DeliveryState::AtLeastOnce(_) => {
                warn!(packet_id, "Ignoring PUBREC for non QoS 2 delivery");
                AckOutcome::Ignored
            }
        }
    }

    /// PUBCOMP for a QoS 2 delivery; ignored unless PUBREC came first.
    pub fn on_complete(&mut self, packet_id: u16) -> AckOutcome {
        match self.pending.get(&packet_id) {
            Some(d) if d.state == DeliveryState::ExactlyOnce(Qos2State::Received) => {
                self.finish(packet_id, DeliveryState::ExactlyOnce(Qos2State::Completed))
            }
            Some(d) => {
                warn!(packet_id, state = ?d.state, "Ignoring out-of-order PUBCOMP");
                AckOutcome::Ignored
            }
            None => {
                warn!(packet_id, "Ignoring PUBCOMP for unknown packet id");
                AckOutcome::Ignored
            }
        }
    }

    fn finish(&mut self, packet_id: u16, terminal: DeliveryState) -> AckOutcome {
        let Some(mut delivery) = self.pending.remove(&packet_id) else {
            return AckOutcome::Ignored;
        };
        delivery.state = terminal;
        debug!(packet_id, state = ?terminal, attempts = delivery.attempts, "Delivery complete");
        let receipt = delivery.receipt();
        delivery.resolve(Ok(receipt));
        AckOutcome::Completed
    }

    /// Discards every entry; their handles fail with `SessionReset`.
    pub fn reset(&mut self) -> usize {
        self.fail_all(DeliveryError::SessionReset)
    }

    /// Discards every entry, failing their handles with `error`.
    pub fn fail_all(&mut self, error: DeliveryError) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for delivery in pending.into_values() {
            delivery.resolve(Err(error));
        }
        if count > 0 {
            debug!(count, %error, "Released pending deliveries");
        }
        count
    }

    /// Abandons entries whose last transmission is older than `max_age`.
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> usize {
        let stale: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, d)| now.saturating_duration_since(d.last_sent_at) > max_age)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(delivery) = self.pending.remove(id) {
                warn!(packet_id = id, attempts = delivery.attempts, "Delivery expired");
                delivery.resolve(Err(DeliveryError::Expired));
            }
        }
        stale.len()
    }

    /// Packets to re-send after a resumed session, ascending by identifier.
    pub fn replay_pending(&mut self, now: Instant) -> Vec<Replay> {
        self.pending
            .values_mut()
            .filter(|d| !d.state.is_terminal())
            .map(|delivery| {
                delivery.attempts += 1;
                delivery.last_sent_at = now;
                match delivery.state {
                    DeliveryState::ExactlyOnce(Qos2State::Received) => {
                        Replay::Release(PubRel::new(delivery.packet_id.get()))
                    }
                    _ => Replay::Publish(delivery.to_publish(true)),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.pending.contains_key(&packet_id)
    }

    pub fn state(&self, packet_id: u16) -> Option<DeliveryState> {
        self.pending.get(&packet_id).map(|d| d.state)
    }

    pub fn get(&self, packet_id: u16) -> Option<&PendingDelivery> {
        self.pending.get(&packet_id)
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&mut self, next_id: u16) {
        self.next_id = next_id.max(1);
    }
}
