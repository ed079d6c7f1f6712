//! mqtt-pubsub-bridge - MQTT over TLS to Google Cloud Pub/Sub relay
//!
//! Usage:
//!   mqtt-pubsub-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   --host <HOST>          MQTT broker hostname
//!   --port <PORT>          MQTT broker port
//!   -t, --topic <TOPIC>    MQTT topic filter to subscribe to
//!   --ca-cert <FILE>       CA certificate used to verify the broker
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mqtt_pubsub_bridge::config::Config;
use mqtt_pubsub_bridge::{listen_for_signals, Bridge, Metrics, MetricsServer, ShutdownCoordinator};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Relay messages from an MQTT topic to a Google Cloud Pub/Sub topic
#[derive(Parser, Debug)]
#[command(name = "mqtt-pubsub-bridge")]
#[command(version)]
#[command(about = "Relays messages from an MQTT topic over TLS to Google Cloud Pub/Sub")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT broker hostname
    #[arg(long)]
    host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    port: Option<u16>,

    /// MQTT topic filter to subscribe to
    #[arg(short, long)]
    topic: Option<String>,

    /// CA certificate (PEM) used to verify the broker
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI flags override file and environment settings
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.mqtt.host = host.clone();
        }
        if let Some(port) = self.port {
            config.mqtt.port = port;
        }
        if let Some(topic) = &self.topic {
            config.mqtt.topic = topic.clone();
        }
        if let Some(ca_cert) = &self.ca_cert {
            config.mqtt.tls.ca_cert = ca_cert.to_string_lossy().into_owned();
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
        std::process::exit(1);
    }

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting mqtt-pubsub-bridge");
    info!(
        "  MQTT broker: {}:{} (MQTT protocol level {}, {})",
        config.mqtt.host, config.mqtt.port, config.mqtt.protocol_version, config.mqtt.tls.version
    );
    info!("  MQTT topic: {} (QoS {})", config.mqtt.topic, config.mqtt.qos);
    info!("  Pub/Sub topic: {}", config.pubsub.topic_path());

    for field in config.placeholder_fields() {
        warn!("{} is still set to its placeholder value", field);
    }

    let shutdown = ShutdownCoordinator::new();

    let metrics = Arc::new(Metrics::new());
    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        let metrics_server = MetricsServer::new(metrics.clone(), config.metrics.bind);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    if let Err(e) = listen_for_signals(shutdown.clone()) {
        error!("Failed to register signal handlers: {}", e);
        std::process::exit(1);
    }

    let bridge = Bridge::new(config).with_metrics(metrics);
    if let Err(e) = bridge.run(shutdown).await {
        error!("Service encountered an error: {}", e);
        std::process::exit(1);
    }
}
