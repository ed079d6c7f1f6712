//! Pub/Sub Publisher Tests
//!
//! Exercises the REST publisher and token handling against a local HTTP
//! server standing in for the emulator, the metadata server and the OAuth2
//! token endpoint.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use jsonwebtoken::{DecodingKey, Validation};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use mqtt_pubsub_bridge::config::PubSubConfig;
use mqtt_pubsub_bridge::pubsub::{Authenticator, ServiceAccountKey, TokenSource};
use mqtt_pubsub_bridge::{ForwardError, ForwardRecord, PubSubPublisher, Publisher};

/// A request as the fake server saw it
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    authorization: Option<String>,
    metadata_flavor: Option<String>,
    body: Bytes,
}

fn header<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Canned reply: status, body, delay before answering
type Reply = (StatusCode, String, Duration);

struct FakeGoogle {
    base: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl FakeGoogle {
    async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Seen) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        let log = log.clone();
                        async move {
                            let authorization = header(&req, "authorization");
                            let metadata_flavor = header(&req, "metadata-flavor");
                            let method = req.method().to_string();
                            let path = req.uri().path().to_string();
                            let body = req
                                .into_body()
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            let seen = Seen {
                                method,
                                path,
                                authorization,
                                metadata_flavor,
                                body,
                            };

                            let (status, body, delay) = (*handler)(&seen);
                            log.lock().push(seen);
                            tokio::time::sleep(delay).await;

                            let mut response = Response::new(Full::new(Bytes::from(body)));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { base, seen }
    }

    fn host(&self) -> &str {
        self.base.trim_start_matches("http://")
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    fn seen_at(&self, path: &str) -> Vec<Seen> {
        self.seen().into_iter().filter(|s| s.path == path).collect()
    }
}

const PUBLISH_PATH: &str = "/v1/projects/acme/topics/telemetry:publish";
const TOKEN_PATH: &str = "/token";

fn ok(body: serde_json::Value) -> Reply {
    (StatusCode::OK, body.to_string(), Duration::ZERO)
}

fn routes(token: serde_json::Value) -> impl Fn(&Seen) -> Reply + Send + Sync + 'static {
    move |seen: &Seen| match seen.path.as_str() {
        TOKEN_PATH => ok(token.clone()),
        PUBLISH_PATH => ok(json!({ "messageIds": ["1234"] })),
        _ => (StatusCode::NOT_FOUND, "not found".to_string(), Duration::ZERO),
    }
}

fn record() -> ForwardRecord {
    ForwardRecord::new(Bytes::from_static(b"21.5"), "mqtt_topic", "sensors/temp")
}

fn emulator_config(server: &FakeGoogle) -> PubSubConfig {
    PubSubConfig {
        project_id: "acme".to_string(),
        topic: "telemetry".to_string(),
        emulator_host: Some(server.host().to_string()),
        ..Default::default()
    }
}

fn publisher_with(server: &FakeGoogle, source: TokenSource) -> PubSubPublisher {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    PubSubPublisher::new(
        http.clone(),
        format!("{}{}", server.base, PUBLISH_PATH),
        Authenticator::new(source, http),
    )
}

#[tokio::test]
async fn test_emulator_publish() {
    let server = FakeGoogle::start(routes(json!({}))).await;
    let publisher = PubSubPublisher::from_config(&emulator_config(&server)).unwrap();

    let message_id = publisher.publish(record()).await.unwrap();
    assert_eq!(message_id, "1234");

    let seen = server.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, PUBLISH_PATH);
    assert_eq!(seen[0].authorization, None);

    let body: serde_json::Value = serde_json::from_slice(&seen[0].body).unwrap();
    assert_eq!(
        body,
        json!({
            "messages": [{
                "data": "MjEuNQ==",
                "attributes": { "mqtt_topic": "sensors/temp" }
            }]
        })
    );
}

#[tokio::test]
async fn test_empty_payload_is_published() {
    let server = FakeGoogle::start(routes(json!({}))).await;
    let publisher = PubSubPublisher::from_config(&emulator_config(&server)).unwrap();

    let record = ForwardRecord::new(Bytes::new(), "mqtt_topic", "sensors/empty");
    publisher.publish(record).await.unwrap();

    let body: serde_json::Value = serde_json::from_slice(&server.seen()[0].body).unwrap();
    assert_eq!(body["messages"][0]["data"], "");
}

#[tokio::test]
async fn test_static_token_is_sent() {
    let server = FakeGoogle::start(routes(json!({}))).await;
    let config = PubSubConfig {
        project_id: "acme".to_string(),
        topic: "telemetry".to_string(),
        endpoint: server.base.clone(),
        access_token: Some("ya29.static".to_string()),
        ..Default::default()
    };
    let publisher = PubSubPublisher::from_config(&config).unwrap();

    publisher.publish(record()).await.unwrap();
    assert_eq!(
        server.seen()[0].authorization.as_deref(),
        Some("Bearer ya29.static")
    );
}

#[tokio::test]
async fn test_rejected_publish() {
    let server = FakeGoogle::start(|_: &Seen| {
        (
            StatusCode::NOT_FOUND,
            r#"{"error":{"message":"Resource not found"}}"#.to_string(),
            Duration::ZERO,
        )
    })
    .await;
    let publisher = PubSubPublisher::from_config(&emulator_config(&server)).unwrap();

    match publisher.publish(record()).await {
        Err(ForwardError::Rejected { status, message }) => {
            assert_eq!(status, 404);
            assert!(message.contains("Resource not found"));
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_publish_times_out() {
    let server = FakeGoogle::start(|_: &Seen| {
        (
            StatusCode::OK,
            json!({ "messageIds": ["late"] }).to_string(),
            Duration::from_secs(3),
        )
    })
    .await;
    let config = PubSubConfig {
        publish_timeout: Duration::from_millis(200),
        ..emulator_config(&server)
    };
    let publisher = PubSubPublisher::from_config(&config).unwrap();

    assert!(matches!(
        publisher.publish(record()).await,
        Err(ForwardError::Timeout)
    ));
}

#[tokio::test]
async fn test_response_without_message_id() {
    let server = FakeGoogle::start(|_: &Seen| ok(json!({ "messageIds": [] }))).await;
    let publisher = PubSubPublisher::from_config(&emulator_config(&server)).unwrap();

    assert!(matches!(
        publisher.publish(record()).await,
        Err(ForwardError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_metadata_token_is_cached() {
    let server = FakeGoogle::start(routes(json!({
        "access_token": "meta-token",
        "expires_in": 3599,
        "token_type": "Bearer"
    })))
    .await;
    let source = TokenSource::Metadata {
        url: format!("{}{}", server.base, TOKEN_PATH),
    };
    let publisher = publisher_with(&server, source);

    publisher.publish(record()).await.unwrap();
    publisher.publish(record()).await.unwrap();

    let token_requests = server.seen_at(TOKEN_PATH);
    assert_eq!(token_requests.len(), 1);
    assert_eq!(token_requests[0].method, "GET");
    assert_eq!(token_requests[0].metadata_flavor.as_deref(), Some("Google"));

    let publishes = server.seen_at(PUBLISH_PATH);
    assert_eq!(publishes.len(), 2);
    for publish in publishes {
        assert_eq!(publish.authorization.as_deref(), Some("Bearer meta-token"));
    }
}

#[tokio::test]
async fn test_token_near_expiry_is_refreshed() {
    // inside the refresh margin, so never reused
    let server = FakeGoogle::start(routes(json!({
        "access_token": "short-lived",
        "expires_in": 30
    })))
    .await;
    let source = TokenSource::Metadata {
        url: format!("{}{}", server.base, TOKEN_PATH),
    };
    let publisher = publisher_with(&server, source);

    publisher.publish(record()).await.unwrap();
    publisher.publish(record()).await.unwrap();

    assert_eq!(server.seen_at(TOKEN_PATH).len(), 2);
}

#[tokio::test]
async fn test_token_failure_skips_publish() {
    let server = FakeGoogle::start(|seen: &Seen| match seen.path.as_str() {
        TOKEN_PATH => (
            StatusCode::FORBIDDEN,
            "no service account".to_string(),
            Duration::ZERO,
        ),
        _ => ok(json!({ "messageIds": ["1"] })),
    })
    .await;
    let source = TokenSource::Metadata {
        url: format!("{}{}", server.base, TOKEN_PATH),
    };
    let publisher = publisher_with(&server, source);

    match publisher.publish(record()).await {
        Err(ForwardError::Auth(message)) => assert!(message.contains("403")),
        other => panic!("expected Auth error, got {:?}", other),
    }
    assert!(server.seen_at(PUBLISH_PATH).is_empty());
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[tokio::test]
async fn test_service_account_assertion_exchange() {
    let server = FakeGoogle::start(routes(json!({
        "access_token": "sa-token",
        "expires_in": 3600
    })))
    .await;
    let token_uri = format!("{}{}", server.base, TOKEN_PATH);

    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("key.json");
    let private_key = std::fs::read_to_string(fixture("service_account.key")).unwrap();
    let key_json = json!({
        "type": "service_account",
        "client_email": "bridge@acme.iam.gserviceaccount.com",
        "private_key": private_key,
        "token_uri": token_uri,
    });
    std::fs::write(&key_path, key_json.to_string()).unwrap();

    let key = ServiceAccountKey::from_file(&key_path).unwrap();
    let publisher = publisher_with(&server, TokenSource::service_account(key).unwrap());
    publisher.publish(record()).await.unwrap();

    let token_requests = server.seen_at(TOKEN_PATH);
    assert_eq!(token_requests.len(), 1);
    assert_eq!(token_requests[0].method, "POST");

    let form = String::from_utf8(token_requests[0].body.to_vec()).unwrap();
    let assertion = form
        .strip_prefix("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer&assertion=")
        .expect("unexpected token request body");

    let public_key = std::fs::read(fixture("service_account.pub")).unwrap();
    let mut validation = Validation::new(jsonwebtoken::Algorithm::RS256);
    validation.set_audience(&[token_uri.as_str()]);
    let claims = jsonwebtoken::decode::<AssertionClaims>(
        assertion,
        &DecodingKey::from_rsa_pem(&public_key).unwrap(),
        &validation,
    )
    .unwrap()
    .claims;

    assert_eq!(claims.iss, "bridge@acme.iam.gserviceaccount.com");
    assert_eq!(claims.scope, "https://www.googleapis.com/auth/pubsub");
    assert_eq!(claims.aud, token_uri);
    assert_eq!(claims.exp - claims.iat, 3600);

    assert_eq!(
        server.seen_at(PUBLISH_PATH)[0].authorization.as_deref(),
        Some("Bearer sa-token")
    );
}

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}
