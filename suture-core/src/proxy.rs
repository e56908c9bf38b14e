//! Reverse proxy data plane.
//!
//! Every request is forwarded to the upstream unchanged. Successful
//! responses are buffered and run through the response middleware; the
//! (possibly healed) body goes back to the client with `X-Suture-*`
//! headers describing what happened. Upstream error statuses are returned
//! untouched and never trigger healing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SutureError};
use crate::middleware::{MiddlewareContext, MiddlewareResult, ResponseMiddleware};
use crate::transform::HealingMetadata;

pub const HEADER_HEALED: &str = "X-Suture-Healed";
pub const HEADER_FROM_CACHE: &str = "X-Suture-From-Cache";
pub const HEADER_MAPPING_VERSION: &str = "X-Suture-Mapping-Version";
pub const HEADER_CONFIDENCE: &str = "X-Suture-Confidence";
pub const HEADER_FINGERPRINT: &str = "X-Suture-Fingerprint";
pub const HEADER_LATENCY_US: &str = "X-Suture-Latency-Us";
pub const HEADER_ERROR: &str = "X-Suture-Error";

/// Upstream HTTP client shared by the proxy and the control plane.
pub type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

pub fn upstream_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new())
        .http1_title_case_headers(true)
        .http1_preserve_header_case(true)
        .build_http()
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on (default: 127.0.0.1:8080)
    pub listen_addr: SocketAddr,

    /// Upstream base URL
    pub target_url: Uri,

    /// Upstream response deadline (default: 30s)
    pub timeout: Duration,

    /// Maximum buffered body size (default: 10MB)
    pub max_body_size: usize,

    /// Attach `X-Suture-*` headers
    pub enable_suture_headers: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 8080).into(),
            target_url: Uri::from_static("http://127.0.0.1:9090"),
            timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            enable_suture_headers: true,
        }
    }
}

/// Lock-free proxy counters.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    pub requests_total: AtomicU64,
    pub requests_healed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub cache_hits: AtomicU64,
    /// Bytes received from upstream
    pub bytes_received: AtomicU64,
    /// Bytes sent to clients
    pub bytes_sent: AtomicU64,
    pub processing_time_us: AtomicU64,
}

/// Point-in-time copy of [`ProxyMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_healed: u64,
    pub requests_failed: u64,
    pub cache_hits: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub avg_latency_us: u64,
}

impl ProxyMetrics {
    #[inline]
    pub fn record_request(&self, metadata: &HealingMetadata, duration_us: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if metadata.healed {
            self.requests_healed.fetch_add(1, Ordering::Relaxed);
        }
        if metadata.from_cache {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.processing_time_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_us(&self) -> u64 {
        let total = self.requests_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        self.processing_time_us.load(Ordering::Relaxed) / total
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_healed: self.requests_healed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            avg_latency_us: self.avg_latency_us(),
        }
    }
}

/// Shared state for the proxy service.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub client: UpstreamClient,
    pub middleware: Arc<dyn ResponseMiddleware>,
    pub metrics: Arc<ProxyMetrics>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig, middleware: Arc<dyn ResponseMiddleware>, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            config,
            client: upstream_client(),
            middleware,
            metrics,
        }
    }
}

pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(state: ProxyState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.state.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            target = %self.state.config.target_url,
            "Suture proxy listening"
        );

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle_request(state, req).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(peer = %peer_addr, error = %e, "Connection error");
                }
            });
        }
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.state.metrics
    }
}

#[instrument(skip(state, req), fields(method = %req.method(), uri = %req.uri()))]
async fn handle_request(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let start = Instant::now();

    match process_request(&state, req, start).await {
        Ok((response, metadata)) => {
            state
                .metrics
                .record_request(&metadata, start.elapsed().as_micros() as u64);
            Ok(response)
        }
        Err(e) => {
            state.metrics.record_failure();
            error!(error = %e, "Request processing failed");
            Ok(error_response(e.status_code(), &e.to_string()))
        }
    }
}

/// Forward, buffer, heal, respond.
async fn process_request(
    state: &ProxyState,
    req: Request<Incoming>,
    start: Instant,
) -> Result<(Response<Full<Bytes>>, HealingMetadata)> {
    let route = req.uri().path().to_string();
    let upstream_req = build_upstream_request(&state.config.target_url, req, state.config.max_body_size).await?;

    let upstream_resp = match tokio::time::timeout(state.config.timeout, state.client.request(upstream_req)).await {
        Ok(resp) => resp?,
        Err(_) => return Err(SutureError::UpstreamTimeout(state.config.timeout.as_millis() as u64)),
    };
    let (parts, body) = upstream_resp.into_parts();
    let body_bytes = read_body(body, state.config.max_body_size).await?;

    state
        .metrics
        .bytes_received
        .fetch_add(body_bytes.len() as u64, Ordering::Relaxed);

    let ctx = MiddlewareContext {
        route: &route,
        request_start: start,
    };

    let mut middleware_error = None;
    let result = if parts.status.is_success() {
        state.middleware.process(&ctx, &body_bytes).await.unwrap_or_else(|e| {
            warn!(route = %route, error = %e, "Middleware error, passing through");
            middleware_error = Some(e.to_string());
            MiddlewareResult::PassThrough {
                metadata: HealingMetadata::default(),
            }
        })
    } else {
        debug!(route = %route, status = %parts.status, "Upstream error status, not healing");
        MiddlewareResult::PassThrough {
            metadata: HealingMetadata::default(),
        }
    };

    let (final_body, mut metadata) = match result {
        MiddlewareResult::PassThrough { metadata } => (body_bytes, metadata),
        MiddlewareResult::Transformed { body, metadata } => (body, metadata),
    };
    metadata.duration_us = start.elapsed().as_micros() as u64;

    state
        .metrics
        .bytes_sent
        .fetch_add(final_body.len() as u64, Ordering::Relaxed);

    let mut response = Response::builder().status(parts.status);
    for (name, value) in parts.headers.iter() {
        if name != CONTENT_LENGTH && !is_hop_by_hop(name) {
            response = response.header(name, value);
        }
    }

    if state.config.enable_suture_headers {
        response = response
            .header(HEADER_HEALED, bool_header(metadata.healed))
            .header(HEADER_FROM_CACHE, bool_header(metadata.from_cache))
            .header(HEADER_MAPPING_VERSION, metadata.mapping_version)
            .header(HEADER_LATENCY_US, metadata.duration_us);
        if let Some(confidence) = metadata.confidence {
            response = response.header(HEADER_CONFIDENCE, format!("{confidence:.2}"));
        }
        if let Some(fingerprint) = metadata.fingerprint {
            response = response.header(HEADER_FINGERPRINT, fingerprint.to_string());
        }
        if let Some(reason) = &middleware_error {
            // header values cannot carry control characters
            let reason: String = reason.chars().filter(|c| !c.is_control()).collect();
            response = response.header(HEADER_ERROR, reason);
        }
    }

    response = response.header(CONTENT_LENGTH, final_body.len());
    Ok((response.body(Full::new(final_body))?, metadata))
}

/// Rewrite the request to target the upstream and buffer its body.
async fn build_upstream_request(target: &Uri, req: Request<Incoming>, max_body: usize) -> Result<Request<Full<Bytes>>> {
    let (parts, body) = req.into_parts();

    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let base = target.path().trim_end_matches('/');
    let uri = format!(
        "{}://{}{}{}",
        target.scheme_str().unwrap_or("http"),
        target.authority().map(|a| a.as_str()).unwrap_or("localhost"),
        base,
        path_and_query,
    );

    let body_bytes = read_body(body, max_body).await?;

    let mut builder = Request::builder().method(parts.method).uri(uri.parse::<Uri>()?);
    for (name, value) in parts.headers.iter() {
        // host is derived from the new uri
        if !is_hop_by_hop(name) && name != http::header::HOST {
            builder = builder.header(name, value);
        }
    }

    Ok(builder.body(Full::new(body_bytes))?)
}

/// Buffer a body, failing once it exceeds `max_size`.
async fn read_body(body: Incoming, max_size: usize) -> Result<Bytes> {
    let collected = Limited::new(body, max_size)
        .collect()
        .await
        .map_err(|e| SutureError::Body(format!("{e} (limit {max_size} bytes)")))?;
    Ok(collected.to_bytes())
}

#[inline]
fn is_hop_by_hop(name: &http::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[inline]
fn bool_header(value: bool) -> HeaderValue {
    HeaderValue::from_static(if value { "true" } else { "false" })
}

fn error_response(status: u16, message: &str) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({ "error": message }).to_string();

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(HEADER_ERROR, HeaderValue::from_static("true"));
    response
}
