//! Pub/Sub request authentication
//!
//! Resolves where OAuth2 access tokens come from and caches them until
//! shortly before they expire.

use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::PubSubError;
use crate::config::PubSubConfig;
use crate::relay::ForwardError;

/// OAuth2 scope for publishing
pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

/// GCE/GKE metadata server token endpoint
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime requested for self-signed assertions
const ASSERTION_LIFETIME: u64 = 3600;

/// The fields of a service account JSON key that token exchange needs
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, PubSubError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PubSubError::Credentials(format!(
                "Failed to read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            PubSubError::Credentials(format!("Failed to parse credentials JSON: {}", e))
        })
    }
}

/// Where access tokens come from
pub enum TokenSource {
    /// Emulator: requests carry no credentials
    Anonymous,
    /// A pre-issued access token used as-is
    Static(String),
    /// Self-signed JWT exchanged at the key's token URI
    ServiceAccount {
        client_email: String,
        token_uri: String,
        key: EncodingKey,
    },
    /// Token endpoint of the instance metadata server
    Metadata { url: String },
}

impl TokenSource {
    /// Pick the token source for `config`.
    ///
    /// Order: emulator, static token, service account key, metadata server.
    pub fn from_config(config: &PubSubConfig) -> Result<Self, PubSubError> {
        if config.emulator_host.is_some() {
            return Ok(TokenSource::Anonymous);
        }
        if let Some(token) = &config.access_token {
            return Ok(TokenSource::Static(token.clone()));
        }
        if let Some(path) = &config.credentials {
            let key = ServiceAccountKey::from_file(Path::new(path))?;
            return Self::service_account(key);
        }
        Ok(TokenSource::Metadata {
            url: METADATA_TOKEN_URL.to_string(),
        })
    }

    pub fn service_account(key: ServiceAccountKey) -> Result<Self, PubSubError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
            PubSubError::Credentials(format!("Invalid service account private key: {}", e))
        })?;
        Ok(TokenSource::ServiceAccount {
            client_email: key.client_email,
            token_uri: key.token_uri,
            key: encoding_key,
        })
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TokenSource::Anonymous => "emulator (no credentials)",
            TokenSource::Static(_) => "static access token",
            TokenSource::ServiceAccount { .. } => "service account key",
            TokenSource::Metadata { .. } => "metadata server",
        }
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Supplies `Authorization` header values for publish requests
pub struct Authenticator {
    source: TokenSource,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl Authenticator {
    pub fn new(source: TokenSource, http: reqwest::Client) -> Self {
        Self {
            source,
            http,
            cached: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &TokenSource {
        &self.source
    }

    /// `Authorization` header value, or `None` when talking to the emulator
    pub async fn authorization(&self) -> Result<Option<String>, ForwardError> {
        let token = match &self.source {
            TokenSource::Anonymous => return Ok(None),
            TokenSource::Static(token) => token.clone(),
            _ => self.cached_or_fetch().await?,
        };
        Ok(Some(format!("Bearer {}", token)))
    }

    async fn cached_or_fetch(&self) -> Result<String, ForwardError> {
        let fresh = self
            .cached
            .lock()
            .as_ref()
            .filter(|cached| Instant::now() + EXPIRY_MARGIN < cached.expires_at)
            .map(|cached| cached.value.clone());
        if let Some(token) = fresh {
            return Ok(token);
        }

        let response = self.fetch().await?;
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(ASSERTION_LIFETIME));
        debug!(
            "Obtained Pub/Sub access token from {} (valid for {:?})",
            self.source.describe(),
            lifetime
        );

        *self.cached.lock() = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }

    async fn fetch(&self) -> Result<TokenResponse, ForwardError> {
        let request = match &self.source {
            TokenSource::ServiceAccount {
                client_email,
                token_uri,
                key,
            } => {
                let assertion = sign_assertion(client_email, token_uri, key)?;
                self.http.post(token_uri).form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ])
            }
            TokenSource::Metadata { url } => {
                self.http.get(url).header("Metadata-Flavor", "Google")
            }
            TokenSource::Anonymous | TokenSource::Static(_) => {
                return Err(ForwardError::Auth(
                    "token source does not fetch tokens".to_string(),
                ))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ForwardError::Auth(format!("Token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(ForwardError::Auth(format!(
                "Token endpoint returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ForwardError::Auth(format!("Invalid token response: {}", e)))
    }
}

fn sign_assertion(
    client_email: &str,
    token_uri: &str,
    key: &EncodingKey,
) -> Result<String, ForwardError> {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| ForwardError::Auth(format!("System clock error: {}", e)))?
        .as_secs();

    let claims = Claims {
        iss: client_email,
        scope: PUBSUB_SCOPE,
        aud: token_uri,
        iat,
        exp: iat + ASSERTION_LIFETIME,
    };

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
        .map_err(|e| ForwardError::Auth(format!("Failed to sign token assertion: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PubSubConfig {
        PubSubConfig {
            project_id: "p".to_string(),
            topic: "t".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_emulator_wins_over_credentials() {
        let config = PubSubConfig {
            emulator_host: Some("localhost:8085".to_string()),
            access_token: Some("tok".to_string()),
            credentials: Some("/nonexistent.json".to_string()),
            ..config()
        };
        let source = TokenSource::from_config(&config).unwrap();
        assert!(matches!(source, TokenSource::Anonymous));
    }

    #[test]
    fn test_falls_back_to_metadata_server() {
        let source = TokenSource::from_config(&config()).unwrap();
        match source {
            TokenSource::Metadata { url } => assert_eq!(url, METADATA_TOKEN_URL),
            other => panic!("unexpected source: {}", other.describe()),
        }
    }

    #[test]
    fn test_missing_credentials_file() {
        let config = PubSubConfig {
            credentials: Some("/nonexistent/key.json".to_string()),
            ..config()
        };
        assert!(matches!(
            TokenSource::from_config(&config),
            Err(PubSubError::Credentials(_))
        ));
    }

    #[test]
    fn test_invalid_private_key() {
        let key = ServiceAccountKey {
            client_email: "svc@p.iam.gserviceaccount.com".to_string(),
            private_key: "not a key".to_string(),
            token_uri: default_token_uri(),
        };
        assert!(matches!(
            TokenSource::service_account(key),
            Err(PubSubError::Credentials(_))
        ));
    }

    #[test]
    fn test_token_uri_defaults() {
        let key: ServiceAccountKey = serde_json::from_str(
            r#"{"client_email": "svc@p.iam.gserviceaccount.com", "private_key": "k"}"#,
        )
        .unwrap();
        assert_eq!(key.token_uri, "https://oauth2.googleapis.com/token");
    }

    #[tokio::test]
    async fn test_static_and_anonymous_headers() {
        let http = reqwest::Client::new();
        let auth = Authenticator::new(TokenSource::Static("abc".to_string()), http.clone());
        assert_eq!(
            auth.authorization().await.unwrap(),
            Some("Bearer abc".to_string())
        );

        let auth = Authenticator::new(TokenSource::Anonymous, http);
        assert_eq!(auth.authorization().await.unwrap(), None);
    }
}
