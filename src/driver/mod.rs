//! Lifecycle driver
//!
//! Builds the session and relay, runs the network loop on its own task,
//! waits for the shutdown signal and tears everything down in order.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::pubsub::{PubSubError, PubSubPublisher};
use crate::relay::{MessageRelay, Publisher};
use crate::session::{Connector, SessionConfig, SessionError, SessionManager};
use crate::shutdown::ShutdownCoordinator;

#[cfg(test)]
mod tests;

/// Errors that end the bridge
#[derive(Debug)]
pub enum BridgeError {
    /// Session could not be set up, or the network loop failed
    Session(SessionError),
    /// Pub/Sub publisher could not be built
    Destination(PubSubError),
    /// Network loop task panicked, was cancelled, or exited on its own
    Shutdown(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Session(e) => write!(f, "MQTT session error: {}", e),
            BridgeError::Destination(e) => write!(f, "Pub/Sub error: {}", e),
            BridgeError::Shutdown(msg) => write!(f, "Shutdown error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<SessionError> for BridgeError {
    fn from(e: SessionError) -> Self {
        BridgeError::Session(e)
    }
}

impl From<PubSubError> for BridgeError {
    fn from(e: PubSubError) -> Self {
        BridgeError::Destination(e)
    }
}

/// MQTT to Pub/Sub bridge
pub struct Bridge {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    publisher: Option<Arc<dyn Publisher>>,
    metrics: Arc<Metrics>,
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connector: None,
            publisher: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Open broker connections through `connector` instead of TLS
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Forward to `publisher` instead of the configured Pub/Sub topic
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run until `shutdown` is signaled.
    ///
    /// Returns once the network loop has sent DISCONNECT and its task has
    /// been joined.
    pub async fn run(self, shutdown: ShutdownCoordinator) -> Result<(), BridgeError> {
        let session_config = SessionConfig::try_from(&self.config.mqtt)?;

        let publisher = match self.publisher {
            Some(publisher) => publisher,
            None => Arc::new(PubSubPublisher::from_config(&self.config.pubsub)?),
        };
        let relay = MessageRelay::new(publisher)
            .with_attribute_key(self.config.pubsub.topic_attribute.clone())
            .with_metrics(self.metrics.clone());

        let mut session = SessionManager::new().with_metrics(self.metrics.clone());
        if let Some(connector) = self.connector {
            session = session.with_connector(connector);
        }

        let host = session_config.host.clone();
        let port = session_config.port;
        let keepalive = session_config.keepalive;
        session.configure(session_config)?;
        session.connect(&host, port, keepalive)?;
        let session = Arc::new(session);

        let mut network = {
            let session = session.clone();
            tokio::spawn(async move { session.run_network_loop(&relay).await })
        };

        tokio::select! {
            _ = shutdown.wait() => {}
            result = &mut network => {
                let reason = match result {
                    Ok(Ok(())) => "network loop exited without a stop request".to_string(),
                    Ok(Err(e)) => return Err(BridgeError::Session(e)),
                    Err(e) => format!("network loop task failed: {}", e),
                };
                error!("{}", reason);
                return Err(BridgeError::Shutdown(reason));
            }
        }

        info!("Stopping MQTT loop...");
        session.disconnect();

        match network.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BridgeError::Session(e)),
            Err(e) => {
                return Err(BridgeError::Shutdown(format!(
                    "network loop task failed: {}",
                    e
                )))
            }
        }

        info!("Service terminated gracefully");
        Ok(())
    }
}
