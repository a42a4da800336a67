//! Transport binding between the session kernel and the network.
//!
//! The kernel speaks in whole MQTT packets. A [`Connector`] opens a fresh
//! [`Transport`] for every connect attempt; the transport sends packets and
//! yields inbound ones until the stream ends. Socket setup and TLS live
//! behind this seam, which also lets tests drive the kernel with an
//! in-memory broker.
//!
//! [`TcpConnector`] is the plain TCP binding. It frames packets with the
//! MQTT 3.1.1 codec from `rumqttc`.

use std::{future::Future, io};

use bytes::BytesMut;
use rumqttc::{
    mqttbytes::{self, v4},
    Disconnect, Packet, PingReq, PingResp,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, trace};

use crate::config::Config;

/// A bound, bidirectional packet stream.
///
/// `next_packet` must be cancel-safe: the kernel polls it inside
/// `tokio::select!` and drops the future whenever another branch wins.
pub trait Transport: Send + 'static {
    /// Writes one packet to the peer.
    fn send(&mut self, packet: Packet) -> impl Future<Output = io::Result<()>> + Send;

    /// Next inbound packet. `None` means the peer closed the stream.
    fn next_packet(&mut self) -> impl Future<Output = Option<io::Result<Packet>>> + Send;
}

/// Opens transports on demand.
pub trait Connector: Send + 'static {
    type Transport: Transport;

    fn connect(&mut self) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// Connects to `host:port` over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    max_packet_size: usize,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, max_packet_size: usize) -> Self {
        Self {
            host: host.into(),
            port,
            max_packet_size,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.host.clone(), config.port, config.max_packet_size)
    }
}

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&mut self) -> io::Result<TcpTransport> {
        debug!(host = %self.host, port = self.port, "Opening TCP connection");
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport::new(stream, self.max_packet_size))
    }
}

/// MQTT packets framed over a TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_packet_size: usize,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_packet_size: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: BytesMut::with_capacity(4 * 1024),
            max_packet_size,
        }
    }
}

fn codec_error(err: mqttbytes::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Encodes `packet` into `buf` with the MQTT 3.1.1 writers, returning the
/// number of bytes written.
fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<usize, mqttbytes::Error> {
    match packet {
        Packet::Connect(connect) => connect.write(buf),
        Packet::ConnAck(ack) => ack.write(buf),
        Packet::Publish(publish) => publish.write(buf),
        Packet::PubAck(ack) => ack.write(buf),
        Packet::PubRec(rec) => rec.write(buf),
        Packet::PubRel(rel) => rel.write(buf),
        Packet::PubComp(comp) => comp.write(buf),
        Packet::Subscribe(subscribe) => subscribe.write(buf),
        Packet::SubAck(ack) => ack.write(buf),
        Packet::Unsubscribe(unsubscribe) => unsubscribe.write(buf),
        Packet::UnsubAck(ack) => ack.write(buf),
        Packet::PingReq => PingReq.write(buf),
        Packet::PingResp => PingResp.write(buf),
        Packet::Disconnect => Disconnect.write(buf),
    }
}

impl Transport for TcpTransport {
    async fn send(&mut self, packet: Packet) -> io::Result<()> {
        self.write_buf.clear();
        let written = encode(&packet, &mut self.write_buf).map_err(codec_error)?;
        // The writers do not enforce a size limit.
        if written > self.max_packet_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "packet of {} bytes exceeds the {} byte limit",
                    written, self.max_packet_size
                ),
            ));
        }
        trace!(bytes = written, "Writing packet");
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await
    }

    async fn next_packet(&mut self) -> Option<io::Result<Packet>> {
        // Partial frames stay in `read_buf` across cancellations.
        loop {
            match v4::read(&mut self.read_buf, self.max_packet_size) {
                Ok(packet) => return Some(Ok(packet)),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Some(Err(codec_error(e))),
            }

            match self.stream.read_buf(&mut self.read_buf).await {
                Ok(0) if self.read_buf.is_empty() => return None,
                Ok(0) => {
                    return Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-packet",
                    )))
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
