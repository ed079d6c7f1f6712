//! Google Cloud Pub/Sub publisher
//!
//! Publishes forward records through the Pub/Sub REST API
//! (`POST /v1/projects/{project}/topics/{topic}:publish`). The message id in
//! the response is the delivery confirmation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PubSubConfig;
use crate::relay::{ForwardError, ForwardRecord, Publisher};

pub mod auth;

pub use auth::{Authenticator, ServiceAccountKey, TokenSource};

/// Errors building the publisher
#[derive(Debug)]
pub enum PubSubError {
    /// Credentials could not be loaded
    Credentials(String),
    /// HTTP client could not be built
    Http(reqwest::Error),
}

impl std::fmt::Display for PubSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubError::Credentials(msg) => write!(f, "Credentials error: {}", msg),
            PubSubError::Http(e) => write!(f, "HTTP client error: {}", e),
        }
    }
}

impl std::error::Error for PubSubError {}

impl From<reqwest::Error> for PubSubError {
    fn from(e: reqwest::Error) -> Self {
        PubSubError::Http(e)
    }
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: [PubsubMessage<'a>; 1],
}

#[derive(Serialize)]
struct PubsubMessage<'a> {
    data: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Publisher backed by the Pub/Sub REST API
pub struct PubSubPublisher {
    http: reqwest::Client,
    publish_url: String,
    auth: Authenticator,
}

impl PubSubPublisher {
    /// Build a publisher for the topic in `config`, resolving credentials.
    pub fn from_config(config: &PubSubConfig) -> Result<Self, PubSubError> {
        let http = reqwest::Client::builder()
            .timeout(config.publish_timeout)
            .build()?;
        let source = TokenSource::from_config(config)?;
        let publish_url = format!("{}/v1/{}:publish", config.api_root(), config.topic_path());

        info!(
            "Publishing to {} via {} ({})",
            config.topic_path(),
            config.api_root(),
            source.describe()
        );
        Ok(Self::new(http.clone(), publish_url, Authenticator::new(source, http)))
    }

    pub fn new(http: reqwest::Client, publish_url: String, auth: Authenticator) -> Self {
        Self {
            http,
            publish_url,
            auth,
        }
    }

    pub fn publish_url(&self) -> &str {
        &self.publish_url
    }
}

fn request_error(e: reqwest::Error) -> ForwardError {
    if e.is_timeout() {
        ForwardError::Timeout
    } else {
        ForwardError::Transport(e.to_string())
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    async fn publish(&self, record: ForwardRecord) -> Result<String, ForwardError> {
        let body = PublishRequest {
            messages: [PubsubMessage {
                data: STANDARD.encode(&record.payload),
                attributes: &record.attributes,
            }],
        };

        let mut request = self.http.post(&self.publish_url).json(&body);
        if let Some(authorization) = self.auth.authorization().await? {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            warn!("Pub/Sub returned {}", status.as_u16());
            return Err(ForwardError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: PublishResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ForwardError::Timeout
            } else {
                ForwardError::InvalidResponse(e.to_string())
            }
        })?;

        parsed
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| ForwardError::InvalidResponse("no message id returned".to_string()))
    }
}
