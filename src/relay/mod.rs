//! Message Relay
//!
//! Turns each inbound MQTT message into one publish call against the
//! destination and waits for its confirmation. Failures are logged and the
//! message is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, info};

use crate::metrics::Metrics;
use crate::session::InboundMessage;


/// Attribute key used when none is configured
pub const DEFAULT_TOPIC_ATTRIBUTE: &str = "mqtt_topic";

/// Errors from a single forwarding attempt
#[derive(Debug)]
pub enum ForwardError {
    /// No confirmation within the request timeout
    Timeout,
    /// Destination answered with a non-success status
    Rejected { status: u16, message: String },
    /// Request could not be sent or the response could not be read
    Transport(String),
    /// Credentials could not be obtained
    Auth(String),
    /// Destination answered without a usable message id
    InvalidResponse(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Timeout => write!(f, "Publish timed out"),
            ForwardError::Rejected { status, message } => {
                write!(f, "Publish rejected ({}): {}", status, message)
            }
            ForwardError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ForwardError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            ForwardError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Payload plus attributes sent to the destination for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRecord {
    pub payload: Bytes,
    pub attributes: BTreeMap<String, String>,
}

impl ForwardRecord {
    /// Record carrying `payload` and the origin topic under `attribute_key`
    pub fn new(payload: Bytes, attribute_key: &str, origin_topic: &str) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(attribute_key.to_string(), origin_topic.to_string());
        Self {
            payload,
            attributes,
        }
    }
}

/// Destination that confirms each published record with a message id
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, record: ForwardRecord) -> Result<String, ForwardError>;
}

/// Result of relaying one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Forwarded { message_id: String },
    Dropped,
}

/// Forwards inbound messages to a [`Publisher`]
pub struct MessageRelay {
    publisher: Arc<dyn Publisher>,
    attribute_key: String,
    metrics: Arc<Metrics>,
}

impl MessageRelay {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            attribute_key: DEFAULT_TOPIC_ATTRIBUTE.to_string(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Attribute key carrying the origin topic
    pub fn with_attribute_key(mut self, key: impl Into<String>) -> Self {
        self.attribute_key = key.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn attribute_key(&self) -> &str {
        &self.attribute_key
    }

    /// Forward one message and wait for the destination to confirm it.
    ///
    /// Exactly one publish is attempted. Errors never escape: they are
    /// logged and reported as [`RelayOutcome::Dropped`].
    pub async fn on_message(&self, message: InboundMessage) -> RelayOutcome {
        info!("Message received from MQTT: {}", message.topic);
        self.metrics.message_received(message.payload.len());

        let record = ForwardRecord::new(message.payload, &self.attribute_key, &message.topic);
        match self.publisher.publish(record).await {
            Ok(message_id) => {
                self.metrics.message_forwarded();
                info!("Message forwarded to Pub/Sub");
                debug!("Pub/Sub message id {} for '{}'", message_id, message.topic);
                RelayOutcome::Forwarded { message_id }
            }
            Err(e) => {
                self.metrics.message_failed();
                error!(
                    "Failed to forward message from '{}' to Pub/Sub: {}",
                    message.topic, e
                );
                RelayOutcome::Dropped
            }
        }
    }
}
