//! Source Broker Session
//!
//! Owns the one TLS session with the source broker: credentials and TLS
//! setup, connect and reconnect, subscription registration, and the network
//! loop that hands every inbound message to the relay.
//!
//! A `SessionManager` drives a single session lifetime. Once `disconnect`
//! has been requested the stop signal is never reset.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, MqttTlsConfig};
use crate::metrics::Metrics;
use crate::protocol::{
    DecodeError, EncodeError, Packet, ProtocolVersion, Publish, QoS, ReasonCode, Subscribe,
    Subscription,
};
use crate::relay::MessageRelay;

mod network;
mod state;
mod tls;
mod transport;


pub use state::ConnectionState;
pub use tls::{load_tls_connector, TlsError, TlsTransport};
pub use transport::{Connector, Stream};

/// Session errors
#[derive(Debug)]
pub enum SessionError {
    /// Settings or TLS material are unusable
    Configuration(String),
    /// Operation not allowed in the current state
    InvalidState(&'static str),
    Io(std::io::Error),
    /// TCP/TLS connect or CONNACK did not arrive in time
    Timeout,
    Decode(DecodeError),
    Encode(EncodeError),
    /// Broker violated the protocol
    Protocol(String),
    ConnectionLost(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            SessionError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            SessionError::Io(e) => write!(f, "IO error: {}", e),
            SessionError::Timeout => write!(f, "Timed out"),
            SessionError::Decode(e) => write!(f, "Decode error: {}", e),
            SessionError::Encode(e) => write!(f, "Encode error: {}", e),
            SessionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SessionError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        SessionError::Decode(e)
    }
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        SessionError::Encode(e)
    }
}

impl From<TlsError> for SessionError {
    fn from(e: TlsError) -> Self {
        SessionError::Configuration(e.to_string())
    }
}

/// Immutable settings for the source-broker session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Topic filter subscribed on every successful CONNACK
    pub topic: String,
    pub qos: QoS,
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub keepalive: u16,
    pub clean_start: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub max_packet_size: usize,
    pub tls: MqttTlsConfig,
}

impl TryFrom<&MqttConfig> for SessionConfig {
    type Error = SessionError;

    fn try_from(config: &MqttConfig) -> Result<Self, Self::Error> {
        let qos = QoS::from_u8(config.qos).ok_or_else(|| {
            SessionError::Configuration(format!("invalid subscription QoS {}", config.qos))
        })?;
        let protocol_version = ProtocolVersion::from_u8(config.protocol_version).ok_or_else(|| {
            SessionError::Configuration(format!(
                "unsupported protocol version {}",
                config.protocol_version
            ))
        })?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            topic: config.topic.clone(),
            qos,
            client_id: config.client_id.clone(),
            protocol_version,
            keepalive: config.keepalive,
            clean_start: config.clean_start,
            username: config.username.clone(),
            password: config.password.clone(),
            connect_timeout: config.connect_timeout_duration(),
            reconnect_interval: config.reconnect_interval_duration(),
            max_reconnect_interval: config.max_reconnect_interval_duration(),
            max_packet_size: config.max_packet_size,
            tls: config.tls.clone(),
        })
    }
}

/// A message received from the source broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

/// Asynchronous events raised by the network loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// CONNACK received
    ConnectResult(ReasonCode),
    /// A message is ready to be relayed
    Message(InboundMessage),
    /// SUBACK received
    SubscribeResult(Vec<ReasonCode>),
    /// The transport failed or the broker closed the session
    ConnectionLost(String),
}

/// Where `connect` pointed the session
#[derive(Debug, Clone)]
struct BrokerAddress {
    host: String,
    port: u16,
    keepalive: u16,
}

/// Source broker session manager
pub struct SessionManager {
    config: Option<SessionConfig>,
    connector: Option<Arc<dyn Connector>>,
    address: Option<BrokerAddress>,
    state: RwLock<ConnectionState>,
    stop_tx: watch::Sender<bool>,
    next_packet_id: AtomicU16,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config: None,
            connector: None,
            address: None,
            state: RwLock::new(ConnectionState::Disconnected),
            stop_tx,
            next_packet_id: AtomicU16::new(1),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Use `connector` instead of building a TLS transport in `configure`
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Apply session settings and load the TLS trust anchor.
    ///
    /// Must be called before [`connect`](Self::connect).
    pub fn configure(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(SessionError::InvalidState(
                "configure called while a session is active",
            ));
        }

        if self.connector.is_none() {
            let transport = TlsTransport::new(&config.tls)?;
            self.connector = Some(Arc::new(transport));
            debug!(
                "Loaded CA certificate from {} ({})",
                config.tls.ca_cert, config.tls.version
            );
        }

        info!(
            "Session configured: client_id={}, MQTT {}, topic '{}'",
            config.client_id, config.protocol_version, config.topic
        );
        self.config = Some(config);
        Ok(())
    }

    /// Point the session at a broker and move to `Connecting`.
    ///
    /// Does no I/O; the network loop opens the connection and reports the
    /// outcome as a [`SessionEvent::ConnectResult`].
    pub fn connect(&mut self, host: &str, port: u16, keepalive: u16) -> Result<(), SessionError> {
        if self.config.is_none() {
            return Err(SessionError::Configuration(
                "configure must be called before connect".to_string(),
            ));
        }
        if host.trim().is_empty() {
            return Err(SessionError::Configuration(
                "broker host must not be empty".to_string(),
            ));
        }
        if port == 0 {
            return Err(SessionError::Configuration(
                "broker port must not be 0".to_string(),
            ));
        }
        if self.state() != ConnectionState::Disconnected {
            return Err(SessionError::InvalidState(
                "connect called while a session is active",
            ));
        }

        self.address = Some(BrokerAddress {
            host: host.to_string(),
            port,
            keepalive,
        });
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to MQTT broker at {}:{}", host, port);
        Ok(())
    }

    /// Ask the network loop to stop.
    ///
    /// Safe to call from any task and any number of times. The loop sends
    /// DISCONNECT if a session is open and returns once it observes the
    /// request between packets.
    pub fn disconnect(&self) {
        if self.stop_tx.send_replace(true) {
            debug!("Disconnect already requested");
            return;
        }

        let mut state = self.state.write();
        if *state != ConnectionState::Disconnected {
            debug!("Session state: {} -> {}", *state, ConnectionState::Disconnecting);
            *state = ConnectionState::Disconnecting;
            self.metrics.set_connection_state(ConnectionState::Disconnecting);
        }
        info!("Disconnect requested");
    }

    /// Whether `disconnect` has been called
    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    fn set_state(&self, new: ConnectionState) {
        let mut state = self.state.write();
        // Once disconnecting, the only way out is Disconnected
        if *state == ConnectionState::Disconnecting && new != ConnectionState::Disconnected {
            return;
        }
        if *state != new {
            debug!("Session state: {} -> {}", *state, new);
            *state = new;
            self.metrics.set_connection_state(new);
        }
    }

    fn next_packet_id(&self) -> u16 {
        let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.next_packet_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Apply a session event, returning the packet to send in response.
    ///
    /// A successful CONNACK yields the SUBSCRIBE for the configured topic.
    /// A refused CONNACK is logged and leaves the session `Disconnected`;
    /// it is not retried.
    pub async fn handle_event(&self, event: SessionEvent, relay: &MessageRelay) -> Option<Packet> {
        match event {
            SessionEvent::ConnectResult(code) if code.is_success() => {
                info!("Connected to MQTT broker");
                let config = self.config.as_ref()?;
                self.set_state(ConnectionState::Connected);
                debug!("Subscribing to '{}' (QoS {})", config.topic, config.qos as u8);
                Some(Packet::Subscribe(Subscribe {
                    packet_id: self.next_packet_id(),
                    subscriptions: vec![Subscription {
                        filter: config.topic.clone(),
                        qos: config.qos,
                    }],
                }))
            }
            SessionEvent::ConnectResult(code) => {
                error!("Failed to connect to MQTT broker: {}", code);
                self.set_state(ConnectionState::Disconnected);
                None
            }
            SessionEvent::Message(message) => {
                relay.on_message(message).await;
                None
            }
            SessionEvent::SubscribeResult(codes) => {
                let topic = self.config.as_ref().map(|c| c.topic.as_str()).unwrap_or("");
                for code in codes {
                    if code.is_success() {
                        info!("Subscribed to '{}' ({})", topic, code);
                    } else {
                        error!("Subscription to '{}' rejected: {}", topic, code);
                    }
                }
                None
            }
            SessionEvent::ConnectionLost(reason) => {
                if self.is_stop_requested() {
                    debug!("Connection closed during shutdown: {}", reason);
                } else {
                    warn!("Connection to MQTT broker lost: {}", reason);
                    self.set_state(ConnectionState::Connecting);
                }
                None
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
