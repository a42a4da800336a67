//! In-memory broker double for driving the session kernel in tests.
//!
//! `MockConnector` hands the kernel a channel-backed transport per connect
//! attempt and the matching broker end to the test through `MockBroker`.
//! Each attempt follows the next entry of a script; attempts past the end of
//! the script fail with `ConnectionRefused`.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use device_mqtt::{
    Config, ConnAck, ConnectReturnCode, Connector, Packet, ReconnectConfig, Transport,
};
use rumqttc::{Connect, Publish};
use tokio::sync::mpsc;

/// What the next connect attempt does.
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Connector error; no transport is opened.
    Fail,
    /// Transport opens and the broker answers CONNECT with this CONNACK.
    Accept(ConnAck),
    /// Transport opens but the broker never answers.
    Silent,
    /// Opening the transport never finishes.
    Hang,
}

impl Attempt {
    pub fn accept(session_present: bool) -> Self {
        Attempt::Accept(ConnAck::new(ConnectReturnCode::Success, session_present))
    }

    pub fn refuse(code: ConnectReturnCode) -> Self {
        Attempt::Accept(ConnAck::new(code, false))
    }
}

pub struct MockTransport {
    to_broker: mpsc::UnboundedSender<Packet>,
    from_broker: mpsc::UnboundedReceiver<Packet>,
}

impl Transport for MockTransport {
    async fn send(&mut self, packet: Packet) -> io::Result<()> {
        self.to_broker
            .send(packet)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "broker closed"))
    }

    async fn next_packet(&mut self) -> Option<io::Result<Packet>> {
        self.from_broker.recv().await.map(Ok)
    }
}

/// Broker end of one accepted connection.
pub struct BrokerLink {
    from_client: mpsc::UnboundedReceiver<Packet>,
    to_client: mpsc::UnboundedSender<Packet>,
}

impl BrokerLink {
    pub async fn next(&mut self) -> Packet {
        tokio::time::timeout(Duration::from_secs(300), self.from_client.recv())
            .await
            .expect("timed out waiting for a client packet")
            .expect("client closed the link")
    }

    pub async fn expect_connect(&mut self) -> Connect {
        match self.next().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.next().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    pub fn send(&self, packet: Packet) {
        let _ = self.to_client.send(packet);
    }

    /// Next client packet if one is already queued.
    pub fn try_next(&mut self) -> Option<Packet> {
        self.from_client.try_recv().ok()
    }

    /// Drops the connection without a DISCONNECT, as a network failure would.
    pub fn sever(self) {
        drop(self);
    }
}

#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<VecDeque<Attempt>>>,
    attempts: Arc<AtomicUsize>,
    links: mpsc::UnboundedSender<BrokerLink>,
}

pub struct MockBroker {
    links: mpsc::UnboundedReceiver<BrokerLink>,
    attempts: Arc<AtomicUsize>,
}

impl MockBroker {
    /// Next connection the session opened.
    pub async fn accept(&mut self) -> BrokerLink {
        tokio::time::timeout(Duration::from_secs(300), self.links.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Connect attempts made so far, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

pub fn mock(script: impl IntoIterator<Item = Attempt>) -> (MockConnector, MockBroker) {
    let (links_tx, links_rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = MockConnector {
        script: Arc::new(Mutex::new(script.into_iter().collect())),
        attempts: attempts.clone(),
        links: links_tx,
    };
    let broker = MockBroker {
        links: links_rx,
        attempts,
    };
    (connector, broker)
}

impl MockConnector {
    /// Appends attempts to the script.
    pub fn push(&self, attempt: Attempt) {
        self.script.lock().unwrap().push_back(attempt);
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&mut self) -> io::Result<MockTransport> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let attempt = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Fail);

        let ack = match attempt {
            Attempt::Fail => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "scripted connect failure",
                ))
            }
            Attempt::Accept(ack) => Some(ack),
            Attempt::Silent => None,
            Attempt::Hang => return std::future::pending().await,
        };

        let (to_broker, from_client) = mpsc::unbounded_channel();
        let (to_client, from_broker) = mpsc::unbounded_channel();
        if let Some(ack) = ack {
            // Queued ahead of time; the kernel reads it after sending CONNECT.
            let _ = to_client.send(Packet::ConnAck(ack));
        }
        let _ = self.links.send(BrokerLink {
            from_client,
            to_client,
        });
        Ok(MockTransport {
            to_broker,
            from_broker,
        })
    }
}

/// Deterministic config: no jitter, no keep-alive, short delays.
pub fn test_config() -> Config {
    Config {
        client_id: "device-under-test".to_string(),
        keep_alive: 0,
        connection_timeout: 5,
        reconnect: ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 0,
            max_elapsed_secs: 0,
        },
        ..Default::default()
    }
}
