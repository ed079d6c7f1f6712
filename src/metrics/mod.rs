//! Prometheus metrics for the bridge
//!
//! Exposes relay and connection metrics at the /metrics endpoint.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

use crate::session::ConnectionState;

mod server;

pub use server::MetricsServer;

/// All bridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Relay metrics
    pub messages_received: IntCounter,
    pub messages_forwarded: IntCounter,
    pub messages_failed: IntCounter,
    pub bytes_received: IntCounter,

    // Connection metrics
    pub connection_attempts: IntCounter,
    pub connection_state: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = IntCounter::with_opts(Opts::new(
            "bridge_messages_received_total",
            "Messages received from the MQTT broker",
        ))
        .unwrap();

        let messages_forwarded = IntCounter::with_opts(Opts::new(
            "bridge_messages_forwarded_total",
            "Messages confirmed by Pub/Sub",
        ))
        .unwrap();

        let messages_failed = IntCounter::with_opts(Opts::new(
            "bridge_messages_failed_total",
            "Messages dropped after a failed publish",
        ))
        .unwrap();

        let bytes_received = IntCounter::with_opts(Opts::new(
            "bridge_bytes_received_total",
            "Payload bytes received from the MQTT broker",
        ))
        .unwrap();

        let connection_attempts = IntCounter::with_opts(Opts::new(
            "bridge_connection_attempts_total",
            "Connection attempts to the MQTT broker",
        ))
        .unwrap();

        let connection_state = IntGauge::with_opts(Opts::new(
            "bridge_connection_state",
            "0=disconnected, 1=connecting, 2=connected, 3=disconnecting",
        ))
        .unwrap();

        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_forwarded.clone()))
            .unwrap();
        registry.register(Box::new(messages_failed.clone())).unwrap();
        registry.register(Box::new(bytes_received.clone())).unwrap();
        registry
            .register(Box::new(connection_attempts.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_state.clone()))
            .unwrap();

        Metrics {
            registry,
            messages_received,
            messages_forwarded,
            messages_failed,
            bytes_received,
            connection_attempts,
            connection_state,
        }
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_received.inc();
        self.bytes_received.inc_by(bytes as u64);
    }

    pub fn message_forwarded(&self) {
        self.messages_forwarded.inc();
    }

    pub fn message_failed(&self) {
        self.messages_failed.inc();
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.inc();
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state as i64);
    }

    /// True while the broker session is up
    pub fn is_connected(&self) -> bool {
        self.connection_state.get() == ConnectionState::Connected as i64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
