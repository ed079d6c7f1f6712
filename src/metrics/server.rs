//! HTTP endpoint for Prometheus scrapes and probes
//!
//! `/metrics` renders the registry, `/health` answers while the process is
//! up and `/ready` only while the broker session is connected.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::Metrics;
use crate::shutdown::ShutdownCoordinator;

pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Serve until `shutdown` is signaled. Fails only if the bind address
    /// is unusable or accepting stops working.
    pub async fn run(self, shutdown: ShutdownCoordinator) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint on http://{}/metrics", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.wait() => {
                    debug!("Metrics endpoint stopped");
                    return Ok(());
                }
            };

            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let response = route(&req, &metrics);
                    async move { Ok::<_, Infallible>(response) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    error!("Metrics connection from {} failed: {:?}", peer, e);
                }
            });
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn route<B>(req: &Request<B>, metrics: &Metrics) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metrics.registry.gather(), &mut buffer) {
                error!("Failed to encode metrics: {}", e);
                return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
            }
            let mut response = text(StatusCode::OK, buffer);
            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        "/health" | "/healthz" => text(StatusCode::OK, "OK"),
        "/ready" | "/readyz" if metrics.is_connected() => text(StatusCode::OK, "connected"),
        "/ready" | "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not connected"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}
