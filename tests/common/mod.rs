//! Shared helpers for integration tests
//!
//! `FakeBroker` is a scripted MQTT server on a plain TCP socket. It speaks
//! raw bytes so each test controls exactly what the bridge sees.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use mqtt_pubsub_bridge::codec::{read_variable_int, write_variable_int};
use mqtt_pubsub_bridge::config::Config;
use mqtt_pubsub_bridge::protocol::DecodeError;
use mqtt_pubsub_bridge::session::Stream;
use mqtt_pubsub_bridge::{Connector, ForwardError, ForwardRecord, Publisher};

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const PUBREC: u8 = 5;
pub const PUBREL: u8 = 6;
pub const PUBCOMP: u8 = 7;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens broker connections over plain TCP
pub struct PlainTcp;

#[async_trait]
impl Connector for PlainTcp {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Box<dyn Stream>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

/// Bridge settings pointing at a local fake broker
pub fn bridge_config(port: u16, topic: &str) -> Config {
    let mut config = Config::default();
    config.mqtt.host = "127.0.0.1".to_string();
    config.mqtt.port = port;
    config.mqtt.topic = topic.to_string();
    config.mqtt.client_id = "bridge-it".to_string();
    config.mqtt.connect_timeout = 2;
    config.pubsub.project_id = "test-project".to_string();
    config.pubsub.topic = "relay".to_string();
    config
}

/// One packet as it came off the wire
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub header: u8,
    pub body: Bytes,
}

impl RawPacket {
    pub fn packet_type(&self) -> u8 {
        self.header >> 4
    }

    /// Packet identifier of a SUBSCRIBE or acknowledgement
    pub fn packet_id(&self) -> u16 {
        u16::from_be_bytes([self.body[0], self.body[1]])
    }

    /// Topic filter and requested QoS of a single-entry v3.1.1 SUBSCRIBE
    pub fn subscription(&self) -> (String, u8) {
        let mut body = self.body.slice(2..);
        let len = body.get_u16() as usize;
        let filter = String::from_utf8(body[..len].to_vec()).unwrap();
        (filter, body[len])
    }
}

pub struct FakeBroker {
    listener: TcpListener,
}

impl FakeBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    pub async fn accept(&self) -> BrokerConn {
        self.try_accept(RECV_TIMEOUT)
            .await
            .expect("bridge never connected")
    }

    pub async fn try_accept(&self, wait: Duration) -> Option<BrokerConn> {
        let (stream, _) = timeout(wait, self.listener.accept()).await.ok()?.unwrap();
        Some(BrokerConn::new(stream))
    }
}

/// Broker side of one bridge connection
pub struct BrokerConn<S = TcpStream> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> BrokerConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Next packet from the bridge, `None` once it closed the connection
    pub async fn recv(&mut self) -> Option<RawPacket> {
        self.recv_within(RECV_TIMEOUT)
            .await
            .expect("timed out waiting for a packet")
    }

    /// Like `recv`, but `Err(())` when nothing arrives within `wait`
    pub async fn recv_within(&mut self, wait: Duration) -> Result<Option<RawPacket>, ()> {
        timeout(wait, self.read_packet()).await.map_err(|_| ())
    }

    async fn read_packet(&mut self) -> Option<RawPacket> {
        loop {
            if let Some(packet) = self.parse() {
                return Some(packet);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    fn parse(&mut self) -> Option<RawPacket> {
        if self.buf.len() < 2 {
            return None;
        }
        let (len, len_bytes) = match read_variable_int(&self.buf[1..]) {
            Ok(v) => v,
            Err(DecodeError::InsufficientData) => return None,
            Err(e) => panic!("bad remaining length: {}", e),
        };
        let total = 1 + len_bytes + len as usize;
        if self.buf.len() < total {
            return None;
        }
        let mut frame = self.buf.split_to(total).freeze();
        let header = frame[0];
        frame.advance(1 + len_bytes);
        Some(RawPacket {
            header,
            body: frame,
        })
    }

    /// Next packet, which must be of type `packet_type`
    pub async fn expect(&mut self, packet_type: u8) -> RawPacket {
        let packet = self.recv().await.expect("bridge closed the connection");
        assert_eq!(
            packet.packet_type(),
            packet_type,
            "unexpected packet {:?}",
            packet
        );
        packet
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Accept CONNECT, answer with CONNACK and grant the SUBSCRIBE that
    /// follows. Returns the SUBSCRIBE.
    pub async fn handshake(&mut self) -> RawPacket {
        self.expect(CONNECT).await;
        self.send(&connack(false, 0x00)).await;
        let subscribe = self.expect(SUBSCRIBE).await;
        let (_, qos) = subscribe.subscription();
        self.send(&suback(subscribe.packet_id(), qos)).await;
        subscribe
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

pub fn connack(session_present: bool, code: u8) -> Vec<u8> {
    vec![0x20, 0x02, session_present as u8, code]
}

pub fn suback(packet_id: u16, code: u8) -> Vec<u8> {
    let id = packet_id.to_be_bytes();
    vec![0x90, 0x03, id[0], id[1], code]
}

pub fn pubrel(packet_id: u16) -> Vec<u8> {
    let id = packet_id.to_be_bytes();
    vec![0x62, 0x02, id[0], id[1]]
}

pub fn pingresp() -> Vec<u8> {
    vec![0xD0, 0x00]
}

/// v3.1.1 PUBLISH
pub fn publish(topic: &str, payload: &[u8], qos: u8, packet_id: u16, dup: bool) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16(topic.len() as u16);
    body.put_slice(topic.as_bytes());
    if qos > 0 {
        body.put_u16(packet_id);
    }
    body.put_slice(payload);

    let mut frame = BytesMut::new();
    frame.put_u8(0x30 | (qos << 1) | if dup { 0x08 } else { 0 });
    write_variable_int(&mut frame, body.len() as u32).unwrap();
    frame.put_slice(&body);
    frame.to_vec()
}

/// Publisher that records every record and answers from a script, after
/// an optional delay
#[derive(Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<ForwardRecord>>,
    responses: Mutex<VecDeque<Result<String, ForwardError>>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for the next unanswered call
    pub fn respond(&self, response: Result<String, ForwardError>) {
        self.responses.lock().push_back(response);
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn records(&self) -> Vec<ForwardRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    /// Wait until at least `n` records were published
    pub async fn wait_for(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while self.count() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} published records, got {}",
                n,
                self.count()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, record: ForwardRecord) -> Result<String, ForwardError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let n = {
            let mut records = self.records.lock();
            records.push(record);
            records.len()
        };
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("msg-{}", n)))
    }
}
