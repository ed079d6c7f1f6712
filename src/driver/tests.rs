//! Lifecycle driver tests

use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::relay::{ForwardError, ForwardRecord};
use crate::session::Stream;

struct RefusingConnector;

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, _host: &str, _port: u16) -> std::io::Result<Box<dyn Stream>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ))
    }
}

struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _record: ForwardRecord) -> Result<String, ForwardError> {
        Ok("0".to_string())
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.mqtt.host = "127.0.0.1".to_string();
    config.mqtt.topic = "t".to_string();
    config
}

#[tokio::test]
async fn test_signal_before_connection_shuts_down_cleanly() {
    let shutdown = ShutdownCoordinator::new();
    let bridge = Bridge::new(config())
        .with_connector(Arc::new(RefusingConnector))
        .with_publisher(Arc::new(NullPublisher));

    let handle = tokio::spawn(bridge.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.signal();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("bridge should stop promptly")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_already_signaled_returns_immediately() {
    let shutdown = ShutdownCoordinator::new();
    shutdown.signal();

    let bridge = Bridge::new(config())
        .with_connector(Arc::new(RefusingConnector))
        .with_publisher(Arc::new(NullPublisher));

    let result = tokio::time::timeout(Duration::from_secs(2), bridge.run(shutdown))
        .await
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_unreadable_ca_certificate_is_fatal() {
    let mut config = config();
    config.mqtt.tls.ca_cert = "/nonexistent/ca.pem".to_string();

    let bridge = Bridge::new(config).with_publisher(Arc::new(NullPublisher));
    let result = bridge.run(ShutdownCoordinator::new()).await;
    assert!(matches!(
        result,
        Err(BridgeError::Session(SessionError::Configuration(_)))
    ));
}

#[tokio::test]
async fn test_unreadable_service_account_key_is_fatal() {
    let mut config = config();
    config.pubsub.credentials = Some("/nonexistent/key.json".to_string());

    let bridge = Bridge::new(config).with_connector(Arc::new(RefusingConnector));
    let result = bridge.run(ShutdownCoordinator::new()).await;
    assert!(matches!(result, Err(BridgeError::Destination(_))));
}
