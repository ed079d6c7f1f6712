//! Destination Configuration
//!
//! Google Cloud Pub/Sub topic and authentication settings.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

const PLACEHOLDER_PROJECT: &str = "your-gcp-project-id";
const PLACEHOLDER_TOPIC: &str = "your-pubsub-topic";

/// Pub/Sub configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Google Cloud project ID
    pub project_id: String,
    /// Pub/Sub topic ID within the project
    pub topic: String,
    /// REST API root
    pub endpoint: String,
    /// `host:port` of a Pub/Sub emulator; disables authentication
    pub emulator_host: Option<String>,
    /// Path to a service account JSON key
    pub credentials: Option<String>,
    /// Pre-issued OAuth2 access token
    pub access_token: Option<String>,
    /// Attribute key carrying the originating MQTT topic
    pub topic_attribute: String,
    /// Timeout for a single publish request
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: PLACEHOLDER_PROJECT.to_string(),
            topic: PLACEHOLDER_TOPIC.to_string(),
            endpoint: "https://pubsub.googleapis.com".to_string(),
            emulator_host: None,
            credentials: None,
            access_token: None,
            topic_attribute: "mqtt_topic".to_string(),
            publish_timeout: Duration::from_secs(60),
        }
    }
}

impl PubSubConfig {
    /// Fully-qualified topic name: `projects/{project}/topics/{topic}`
    pub fn topic_path(&self) -> String {
        format!("projects/{}/topics/{}", self.project_id, self.topic)
    }

    /// REST API root, pointing at the emulator when one is configured
    pub fn api_root(&self) -> String {
        match &self.emulator_host {
            Some(host) => format!("http://{}", host.trim_end_matches('/')),
            None => self.endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.project_id.trim().is_empty() {
            return invalid("pubsub.project_id must not be empty");
        }
        if self.topic.trim().is_empty() {
            return invalid("pubsub.topic must not be empty");
        }
        if self.project_id.contains('/') || self.topic.contains('/') {
            return invalid("pubsub.project_id and pubsub.topic must be bare IDs, not paths");
        }
        if self.topic_attribute.is_empty() {
            return invalid("pubsub.topic_attribute must not be empty");
        }
        if self.topic_attribute.starts_with("goog") {
            return invalid("pubsub.topic_attribute must not use the reserved 'goog' prefix");
        }
        if self.publish_timeout.is_zero() {
            return invalid("pubsub.publish_timeout must be greater than zero");
        }
        Ok(())
    }

    pub(super) fn placeholder_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.project_id == PLACEHOLDER_PROJECT {
            fields.push("pubsub.project_id");
        }
        if self.topic == PLACEHOLDER_TOPIC {
            fields.push("pubsub.topic");
        }
        fields
    }
}
