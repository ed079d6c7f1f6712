//! mqtt-pubsub-bridge - MQTT over TLS to Google Cloud Pub/Sub relay
//!
//! Subscribes to one topic on an MQTT v3.1.1/v5.0 broker and forwards every
//! received message, with its origin topic as an attribute, to a Pub/Sub
//! topic. Runs until SIGINT or SIGTERM, then disconnects cleanly.

pub mod codec;
pub mod config;
pub mod driver;
pub mod metrics;
pub mod protocol;
pub mod pubsub;
pub mod relay;
pub mod session;
pub mod shutdown;

pub use config::Config;
pub use driver::{Bridge, BridgeError};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::{ProtocolVersion, QoS};
pub use pubsub::PubSubPublisher;
pub use relay::{ForwardError, ForwardRecord, MessageRelay, Publisher, RelayOutcome};
pub use session::{
    ConnectionState, Connector, InboundMessage, SessionConfig, SessionError, SessionEvent,
    SessionManager,
};
pub use shutdown::{listen_for_signals, ShutdownCoordinator};
