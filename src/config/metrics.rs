//! Metrics endpoint configuration

use std::net::{Ipv4Addr, SocketAddr};

use serde::Deserialize;

use super::ConfigError;

/// Prometheus endpoint settings. Off unless enabled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Address serving `/metrics` and `/health`
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 9464)),
        }
    }
}

impl MetricsConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.bind.port() == 0 {
            return Err(ConfigError::Validation(
                "metrics.bind needs an explicit port when metrics are enabled".to_string(),
            ));
        }
        Ok(())
    }
}
