//! TLS configuration and connector setup
//!
//! Loads the broker's trust anchor (and optional client identity) from PEM
//! files and opens verified TLS connections to the source broker.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{version, ClientConfig, RootCertStore, SupportedProtocolVersion};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::transport::{Connector, Stream};
use crate::config::{MqttTlsConfig, TlsVersion};

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::Io(std::io::Error::new(e.kind(), format!("{}: {}", path, e))))?;
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    PrivateKeyDer::from_pem_reader(BufReader::new(file))
        .map_err(|e| TlsError::PrivateKeyError(format!("Failed to parse private key: {}", e)))
}

/// Load the trust anchors the broker certificate must chain to
fn load_root_store(path: &str) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store.add(cert).map_err(|e| {
            TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&version::TLS13];

fn protocol_versions(v: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match v {
        TlsVersion::V1_2 => TLS12_ONLY,
        TlsVersion::V1_3 => TLS13_ONLY,
    }
}

/// Build a TLS connector that verifies the broker against `config.ca_cert`
/// and speaks only the pinned protocol version.
pub fn load_tls_connector(config: &MqttTlsConfig) -> Result<TlsConnector, TlsError> {
    let root_store = load_root_store(&config.ca_cert)?;

    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(protocol_versions(config.version))
        .map_err(|e| TlsError::ConfigError(format!("Unsupported protocol version: {}", e)))?
        .with_root_certificates(root_store);

    let client_config = match (&config.client_cert, &config.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::ConfigError(format!("Invalid client identity: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(TlsError::ConfigError(
                "client_cert and client_key must be set together".to_string(),
            ))
        }
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Production transport: TCP followed by a verified TLS handshake
pub struct TlsTransport {
    connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsTransport {
    pub fn new(config: &MqttTlsConfig) -> Result<Self, TlsError> {
        Ok(Self {
            connector: load_tls_connector(config)?,
            server_name: config.server_name.clone(),
        })
    }
}

#[async_trait]
impl Connector for TlsTransport {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Box<dyn Stream>> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;

        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
        })?;

        let stream = self.connector.connect(server_name, tcp).await?;
        debug!("TLS handshake with {}:{} complete", host, port);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::CertificateError("test error".to_string());
        assert!(err.to_string().contains("Certificate error"));

        let err = TlsError::ConfigError("config error".to_string());
        assert!(err.to_string().contains("TLS config error"));
    }

    #[test]
    fn test_missing_ca_file_is_an_error() {
        let config = MqttTlsConfig {
            ca_cert: "/nonexistent/ca.pem".to_string(),
            ..Default::default()
        };
        let err = load_tls_connector(&config).err().unwrap();
        assert!(matches!(err, TlsError::Io(_)));
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_ca_file_without_certificates_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let config = MqttTlsConfig {
            ca_cert: file.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(matches!(
            load_tls_connector(&config),
            Err(TlsError::CertificateError(_))
        ));
    }
}
