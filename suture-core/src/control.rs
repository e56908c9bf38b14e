//! Control plane API.
//!
//! Runs on its own port so dashboard traffic never shares a listener with
//! proxied requests. Every endpoint speaks JSON with permissive CORS; when
//! an API key is configured it must arrive as `X-API-Key` (or the
//! `api_key` query parameter, for `EventSource` clients that cannot set
//! headers).
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/v1/health` | liveness |
//! | GET | `/v1/stats` | session, cache, approval and proxy counters |
//! | GET | `/v1/stream` | live thought stream (SSE) |
//! | GET, DELETE | `/v1/history` | buffered thoughts, `?limit=N` |
//! | POST | `/v1/approve` | `{"approved": bool}` for the pending attempt |
//! | GET, POST | `/v1/human-in-loop` | `{"enabled": bool, "threshold": f32}` |
//! | GET | `/v1/schemas` | registered routes |
//! | GET, DELETE | `/v1/mappings` | cached mappings |
//! | DELETE | `/v1/mappings/{fingerprint}` | evict one mapping |
//! | POST | `/v1/upstream/mode?mode=…` | switch the demo upstream, reset cache |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::healer::{EngineStats, HealingEngine};
use crate::proxy::{upstream_client, MetricsSnapshot, ProxyMetrics, UpstreamClient};
use crate::schema::SchemaFingerprint;
use crate::sse::ThoughtStream;

/// Response body: buffered JSON or the SSE stream.
pub type ControlBody = UnsyncBoxBody<Bytes, Infallible>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Modes the demo upstream understands.
pub const UPSTREAM_MODES: &[&str] = &["stable", "drifted", "chaotic"];

const MAX_REQUEST_BODY: usize = 64 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const UPSTREAM_MODE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Address to listen on (default: 127.0.0.1:8081)
    pub listen_addr: SocketAddr,

    /// API key for authentication (None = no auth)
    pub api_key: Option<String>,

    /// Upstream base URL, for the demo mode switch
    pub target_url: Uri,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 8081).into(),
            api_key: None,
            target_url: Uri::from_static("http://127.0.0.1:9090"),
        }
    }
}

/// Shared state for the control plane.
pub struct ControlState {
    pub config: ControlConfig,
    pub engine: HealingEngine,
    pub proxy_metrics: Arc<ProxyMetrics>,
    client: UpstreamClient,
    key_digest: Option<[u8; 32]>,
    started: Instant,
}

impl ControlState {
    pub fn new(config: ControlConfig, engine: HealingEngine, proxy_metrics: Arc<ProxyMetrics>) -> Self {
        let key_digest = config.api_key.as_deref().map(digest_key);
        Self {
            key_digest,
            config,
            engine,
            proxy_metrics,
            client: upstream_client(),
            started: Instant::now(),
        }
    }

    /// Compare key digests without early exit.
    fn authorized(&self, provided: Option<&str>) -> bool {
        let Some(expected) = &self.key_digest else {
            return true;
        };
        let Some(provided) = provided else {
            return false;
        };
        let actual = digest_key(provided);
        let diff = expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }
}

fn digest_key(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

pub struct ControlServer {
    state: Arc<ControlState>,
}

impl ControlServer {
    pub fn new(state: ControlState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.state.config.listen_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Control plane listening");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle_control_request(state, req).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(peer = %peer_addr, error = %e, "Control connection error");
                }
            });
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    approved: bool,
}

#[derive(Debug, Deserialize)]
struct HumanInLoopRequest {
    enabled: bool,
    #[serde(default)]
    threshold: Option<f32>,
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    engine: EngineStats,
    proxy: MetricsSnapshot,
    uptime_secs: u64,
}

/// Route one control request.
pub async fn handle_control_request<B>(
    state: Arc<ControlState>,
    req: Request<B>,
) -> Result<Response<ControlBody>, Infallible>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    if req.method() == Method::OPTIONS {
        return Ok(cors_preflight_response());
    }

    let provided = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query_param(req.uri(), "api_key"));
    if !state.authorized(provided.as_deref()) {
        return Ok(error_json(StatusCode::UNAUTHORIZED, "Invalid or missing API key"));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let engine = &state.engine;

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/v1/health") => json_response(
            StatusCode::OK,
            &json!({
                "status": "healthy",
                "service": "suture",
                "human_in_loop": engine.gate().policy().enabled,
                "cached_mappings": engine.cache().len(),
            }),
        ),

        (&Method::GET, "/v1/stats") => json_response(
            StatusCode::OK,
            &StatsResponse {
                engine: engine.stats(),
                proxy: state.proxy_metrics.snapshot(),
                uptime_secs: state.started.elapsed().as_secs(),
            },
        ),

        (&Method::GET, "/v1/stream") => sse_response(ThoughtStream::new(engine.fabric().subscribe())),

        (&Method::GET, "/v1/history") => {
            let limit = query_param(req.uri(), "limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HISTORY_LIMIT);
            let thoughts = engine.fabric().history(limit);
            json_response(
                StatusCode::OK,
                &json!({ "count": thoughts.len(), "thoughts": thoughts }),
            )
        }

        (&Method::DELETE, "/v1/history") => {
            let cleared = engine.fabric().clear();
            json_response(StatusCode::OK, &json!({ "cleared": cleared }))
        }

        (&Method::POST, "/v1/approve") => match read_json::<ApproveRequest, B>(req).await {
            Err(resp) => resp,
            Ok(body) => match engine.submit_decision(body.approved) {
                Ok(info) => json_response(
                    StatusCode::OK,
                    &json!({
                        "status": decision_label(body.approved),
                        "attempt_id": info.attempt_id,
                        "fingerprint": info.fingerprint,
                    }),
                ),
                Err(e) => error_json(status_of(e.status_code()), &e.to_string()),
            },
        },

        (&Method::GET, "/v1/human-in-loop") => json_response(StatusCode::OK, &engine.gate().policy()),

        (&Method::POST, "/v1/human-in-loop") => match read_json::<HumanInLoopRequest, B>(req).await {
            Err(resp) => resp,
            Ok(body) => {
                let threshold = body.threshold.unwrap_or_else(|| engine.gate().policy().threshold);
                if !(0.0..=1.0).contains(&threshold) {
                    error_json(StatusCode::BAD_REQUEST, "threshold must be within [0, 1]")
                } else {
                    json_response(StatusCode::OK, &engine.set_human_in_loop(body.enabled, threshold))
                }
            }
        },

        (&Method::GET, "/v1/schemas") => {
            let routes: Vec<_> = engine
                .registry()
                .routes()
                .into_iter()
                .map(|(route, schema)| json!({ "route": route, "schema": schema.as_ref() }))
                .collect();
            json_response(
                StatusCode::OK,
                &json!({ "version": engine.registry().version(), "routes": routes }),
            )
        }

        (&Method::GET, "/v1/mappings") => {
            let mappings = engine.cache().entries();
            json_response(
                StatusCode::OK,
                &json!({ "count": mappings.len(), "mappings": mappings }),
            )
        }

        (&Method::DELETE, "/v1/mappings") => {
            let cleared = engine.reset_mappings();
            json_response(StatusCode::OK, &json!({ "cleared": cleared }))
        }

        (&Method::DELETE, p) if p.starts_with("/v1/mappings/") => {
            let raw = &p["/v1/mappings/".len()..];
            match raw.parse::<SchemaFingerprint>() {
                Err(_) => error_json(StatusCode::BAD_REQUEST, "fingerprint must be hex"),
                Ok(fp) if engine.invalidate_mapping(fp) => {
                    json_response(StatusCode::OK, &json!({ "invalidated": fp }))
                }
                Ok(_) => error_json(StatusCode::NOT_FOUND, "no mapping cached for that fingerprint"),
            }
        }

        (&Method::POST, "/v1/upstream/mode") => match query_param(req.uri(), "mode") {
            None => error_json(StatusCode::BAD_REQUEST, "mode query parameter is required"),
            Some(mode) => set_upstream_mode(&state, &mode).await,
        },

        _ => error_json(StatusCode::NOT_FOUND, "Not found"),
    };

    Ok(response)
}

/// Forward the mode switch to the demo upstream, then drop cached mappings.
async fn set_upstream_mode(state: &ControlState, mode: &str) -> Response<ControlBody> {
    let Some(mode) = UPSTREAM_MODES.iter().copied().find(|m| m.eq_ignore_ascii_case(mode)) else {
        return error_json(
            StatusCode::BAD_REQUEST,
            &format!("unknown mode, expected one of: {}", UPSTREAM_MODES.join(", ")),
        );
    };
    let target = &state.config.target_url;
    let uri = format!(
        "{}://{}/mode?mode={}",
        target.scheme_str().unwrap_or("http"),
        target.authority().map(|a| a.as_str()).unwrap_or("localhost"),
        mode
    );

    let request = match uri
        .parse::<Uri>()
        .map_err(|e| e.to_string())
        .and_then(|uri| {
            Request::post(uri)
                .body(Full::new(Bytes::new()))
                .map_err(|e| e.to_string())
        }) {
        Ok(req) => req,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, &format!("invalid mode: {e}")),
    };

    match tokio::time::timeout(UPSTREAM_MODE_TIMEOUT, state.client.request(request)).await {
        Ok(Ok(resp)) if resp.status().is_success() => {
            let cleared = state.engine.reset_mappings();
            info!(mode, cleared, "Upstream mode switched");
            json_response(StatusCode::OK, &json!({ "mode": mode, "cleared_mappings": cleared }))
        }
        Ok(Ok(resp)) => error_json(
            StatusCode::BAD_GATEWAY,
            &format!("upstream rejected mode switch: {}", resp.status()),
        ),
        Ok(Err(e)) => error_json(StatusCode::BAD_GATEWAY, &format!("upstream unavailable: {e}")),
        Err(_) => error_json(StatusCode::GATEWAY_TIMEOUT, "upstream mode switch timed out"),
    }
}

/// Buffer and decode a JSON request body, or produce the 400 to send.
async fn read_json<T, B>(req: Request<B>) -> Result<T, Response<ControlBody>>
where
    T: for<'de> Deserialize<'de>,
    B: Body,
    B::Error: Into<BoxError>,
{
    let bytes = Limited::new(req.into_body(), MAX_REQUEST_BODY)
        .collect()
        .await
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, &format!("unreadable body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| error_json(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")))
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

fn decision_label(approved: bool) -> &'static str {
    if approved {
        "approved"
    } else {
        "rejected"
    }
}

fn status_of(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn with_cors<B>(response: &mut Response<B>) {
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type, X-API-Key"),
    );
    headers.insert("X-Suture-Control", HeaderValue::from_static("true"));
}

fn full(bytes: impl Into<Bytes>) -> ControlBody {
    Full::new(bytes.into()).boxed_unsync()
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<ControlBody> {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": e.to_string() }).to_string().into_bytes(),
        ),
    };
    let mut response = Response::new(full(bytes));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    with_cors(&mut response);
    response
}

fn error_json(status: StatusCode, message: &str) -> Response<ControlBody> {
    json_response(status, &json!({ "error": message }))
}

fn sse_response(stream: ThoughtStream) -> Response<ControlBody> {
    let mut response = Response::new(stream.boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    with_cors(&mut response);
    response
}

fn cors_preflight_response() -> Response<ControlBody> {
    let mut response = Response::new(full(Bytes::new()));
    with_cors(&mut response);
    response
        .headers_mut()
        .insert("Access-Control-Max-Age", HeaderValue::from_static("86400"));
    response
}
