//! Source Broker Configuration
//!
//! Connection, subscription and TLS settings for the MQTT broker the
//! bridge subscribes to.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

const PLACEHOLDER_HOST: &str = "mqtt.example.com";
const PLACEHOLDER_TOPIC: &str = "your/mqtt/topic";
const PLACEHOLDER_USERNAME: &str = "your_username";
const PLACEHOLDER_PASSWORD: &str = "your_password";
const PLACEHOLDER_CA_CERT: &str = "/path/to/your/ca_certificate.pem";

/// TLS protocol version the broker connection is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "1.3")]
    V1_3,
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsVersion::V1_2 => write!(f, "TLSv1.2"),
            TlsVersion::V1_3 => write!(f, "TLSv1.3"),
        }
    }
}

/// TLS configuration for the broker connection.
///
/// Server certificates are always verified against `ca_cert`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttTlsConfig {
    /// Path to CA certificate file (PEM format)
    pub ca_cert: String,
    /// Path to client certificate file (PEM format)
    pub client_cert: Option<String>,
    /// Path to client private key file (PEM format)
    pub client_key: Option<String>,
    /// Server name for SNI (defaults to the broker host)
    pub server_name: Option<String>,
    /// Pinned TLS protocol version
    pub version: TlsVersion,
}

impl Default for MqttTlsConfig {
    fn default() -> Self {
        Self {
            ca_cert: PLACEHOLDER_CA_CERT.to_string(),
            client_cert: None,
            client_key: None,
            server_name: None,
            version: TlsVersion::default(),
        }
    }
}

/// Source broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker hostname
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Topic filter to subscribe to
    pub topic: String,
    /// Requested subscription QoS (0, 1, or 2)
    pub qos: u8,
    /// Client ID to use when connecting
    pub client_id: String,
    /// Protocol level: 4 (v3.1.1) or 5 (v5.0)
    pub protocol_version: u8,
    /// Keep-alive interval in seconds
    pub keepalive: u16,
    /// Use clean session / clean start
    pub clean_start: bool,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Connection timeout in seconds (TCP, TLS and CONNACK)
    pub connect_timeout: u64,
    /// Initial reconnect delay in seconds
    pub reconnect_interval: u64,
    /// Maximum reconnect delay in seconds (for exponential backoff)
    pub max_reconnect_interval: u64,
    /// Largest packet accepted from the broker, in bytes
    pub max_packet_size: usize,
    /// TLS settings
    pub tls: MqttTlsConfig,
}

fn default_client_id() -> String {
    format!("mqtt-pubsub-bridge-{}", std::process::id())
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: PLACEHOLDER_HOST.to_string(),
            port: 8883,
            topic: PLACEHOLDER_TOPIC.to_string(),
            qos: 0,
            client_id: default_client_id(),
            protocol_version: 4,
            keepalive: 60,
            clean_start: true,
            username: Some(PLACEHOLDER_USERNAME.to_string()),
            password: Some(PLACEHOLDER_PASSWORD.to_string()),
            connect_timeout: 30,
            reconnect_interval: 1,
            max_reconnect_interval: 120,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            tls: MqttTlsConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Get the reconnect interval as Duration
    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Get the max reconnect interval as Duration
    pub fn max_reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.host.trim().is_empty() {
            return invalid("mqtt.host must not be empty");
        }
        if self.port == 0 {
            return invalid("mqtt.port must not be 0");
        }
        if self.topic.is_empty() {
            return invalid("mqtt.topic must not be empty");
        }
        if self.qos > 2 {
            return invalid("mqtt.qos must be 0, 1, or 2");
        }
        if !matches!(self.protocol_version, 4 | 5) {
            return invalid("mqtt.protocol_version must be 4 (v3.1.1) or 5 (v5.0)");
        }
        if self.password.is_some() && self.username.is_none() && self.protocol_version == 4 {
            return invalid("mqtt.password requires mqtt.username with protocol_version 4");
        }
        if self.reconnect_interval == 0 {
            return invalid("mqtt.reconnect_interval must be at least 1 second");
        }
        if self.max_reconnect_interval < self.reconnect_interval {
            return invalid("mqtt.max_reconnect_interval must be >= mqtt.reconnect_interval");
        }
        if self.max_packet_size == 0 {
            return invalid("mqtt.max_packet_size must not be 0");
        }
        if self.tls.ca_cert.is_empty() {
            return invalid("mqtt.tls.ca_cert is required");
        }
        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            return invalid("mqtt.tls.client_cert and mqtt.tls.client_key must be set together");
        }
        Ok(())
    }

    pub(super) fn placeholder_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.host == PLACEHOLDER_HOST {
            fields.push("mqtt.host");
        }
        if self.topic == PLACEHOLDER_TOPIC {
            fields.push("mqtt.topic");
        }
        if self.username.as_deref() == Some(PLACEHOLDER_USERNAME) {
            fields.push("mqtt.username");
        }
        if self.password.as_deref() == Some(PLACEHOLDER_PASSWORD) {
            fields.push("mqtt.password");
        }
        if self.tls.ca_cert == PLACEHOLDER_CA_CERT {
            fields.push("mqtt.tls.ca_cert");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_local_testing_placeholders() {
        let config = MqttConfig::default();
        assert_eq!(config.host, "mqtt.example.com");
        assert_eq!(config.port, 8883);
        assert_eq!(config.keepalive, 60);
        assert_eq!(config.tls.version, TlsVersion::V1_2);
        assert!(config.client_id.starts_with("mqtt-pubsub-bridge-"));
        assert!(config.validate().is_ok());
        assert_eq!(config.placeholder_fields().len(), 5);
    }

    #[test]
    fn test_rejects_zero_port() {
        let config = MqttConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_half_configured_client_identity() {
        let mut config = MqttConfig::default();
        config.tls.client_cert = Some("client.pem".to_string());
        assert!(config.validate().is_err());

        config.tls.client_key = Some("client.key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_bounds() {
        let config = MqttConfig {
            reconnect_interval: 10,
            max_reconnect_interval: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(
            MqttConfig::default().max_reconnect_interval_duration(),
            Duration::from_secs(120)
        );
    }
}
