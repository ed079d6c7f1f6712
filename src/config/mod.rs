//! Configuration Module
//!
//! Provides TOML-based configuration for the bridge with support for:
//! - Source broker settings (address, topic, credentials, TLS)
//! - Destination Pub/Sub settings (project, topic, authentication)
//! - Logging and metrics
//! - Environment variable overrides (`BRIDGE__*` prefix and the flat
//!   `MQTT_BROKER`-style variables)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use metrics::MetricsConfig;
pub use mqtt::{MqttConfig, MqttTlsConfig, TlsVersion};
pub use pubsub::PubSubConfig;

mod metrics;
mod mqtt;
mod pubsub;


/// Flat environment variables and the configuration keys they override.
///
/// These take precedence over the config file and `BRIDGE__*` variables.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("MQTT_BROKER", "mqtt.host"),
    ("MQTT_PORT", "mqtt.port"),
    ("MQTT_TOPIC", "mqtt.topic"),
    ("MQTT_USERNAME", "mqtt.username"),
    ("MQTT_PASSWORD", "mqtt.password"),
    ("MQTT_TLS_CERT", "mqtt.tls.ca_cert"),
    ("PROJECT_ID", "pubsub.project_id"),
    ("PUBSUB_TOPIC", "pubsub.topic"),
    ("PUBSUB_EMULATOR_HOST", "pubsub.emulator_host"),
    ("GOOGLE_APPLICATION_CREDENTIALS", "pubsub.credentials"),
];

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex is valid");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Source broker configuration
    pub mqtt: MqttConfig,
    /// Destination Pub/Sub configuration
    pub pubsub: PubSubConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Sources, lowest precedence first:
    /// 1. Built-in defaults
    /// 2. The TOML file, after `${VAR}` / `${VAR:-default}` substitution
    ///    (a missing file is not an error)
    /// 3. `BRIDGE__` variables with double underscores for nesting, e.g.
    ///    `BRIDGE__MQTT__KEEPALIVE=30` overrides `mqtt.keepalive`
    /// 4. The flat variables in [`ENV_OVERRIDES`], e.g. `MQTT_BROKER`
    ///
    /// The result is not validated, so command-line overrides can still be
    /// applied; call [`validate`](Self::validate) afterwards.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("mqtt.port", 8883)?
            .set_default("mqtt.keepalive", 60)?
            .set_default("metrics.enabled", false)?;

        let path = path.as_ref();
        if !path.as_os_str().is_empty() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let substituted = substitute_env_vars(&content);
                    builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("BRIDGE")
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in ENV_OVERRIDES {
            builder = builder.set_override_option(*key, std::env::var(var).ok())?;
        }

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load configuration from environment variables only (no file). Not
    /// validated, like [`load`](Self::load).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        self.pubsub.validate()?;
        self.metrics.validate()?;
        Ok(())
    }

    /// Settings still holding their local-testing placeholder value
    pub fn placeholder_fields(&self) -> Vec<&'static str> {
        let mut fields = self.mqtt.placeholder_fields();
        fields.extend(self.pubsub.placeholder_fields());
        fields
    }
}
