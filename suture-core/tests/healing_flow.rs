//! End-to-end healing scenarios against the deterministic backend, plus one
//! run through the real proxy over TCP.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use suture_core::attempt::AttemptStatus;
use suture_core::events::ThoughtType;
use suture_core::inference::{MappingBackend, StaticBackend};
use suture_core::mapping::Correspondence;
use suture_core::middleware::HealingMiddleware;
use suture_core::proxy::{self, ProxyConfig, ProxyMetrics, ProxyServer, ProxyState};
use suture_core::{EngineConfig, HealingEngine, SchemaRegistry};

const DRIFTED_USER: &[u8] = br#"{"uid": 101, "full_name": "Deepanshu", "email_address": "d@x.com"}"#;

fn renamed_user_mapping() -> Vec<Correspondence> {
    vec![
        Correspondence::new("uid", "user_id", 0.9),
        Correspondence::new("full_name", "name", 0.85),
        Correspondence::new("email_address", "email", 0.95),
    ]
}

fn engine(backend: Arc<StaticBackend>, config: EngineConfig) -> HealingEngine {
    let backend: Arc<dyn MappingBackend> = backend;
    HealingEngine::new(config, Arc::new(SchemaRegistry::with_defaults()), backend)
}

fn gated(threshold: f32, timeout: Duration) -> EngineConfig {
    EngineConfig {
        human_in_loop: true,
        approval_threshold: threshold,
        approval_timeout: timeout,
        ..Default::default()
    }
}

async fn wait_for_pending(engine: &HealingEngine) {
    while !engine.gate().has_pending() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn renamed_fields_are_healed_and_cached() {
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()).with_cost(0.002));
    let engine = engine(Arc::clone(&backend), EngineConfig::default());

    let outcome = engine.heal("/api/users/101", DRIFTED_USER).await.unwrap();

    let body = outcome.body.expect("body should be healed");
    assert_eq!(
        std::str::from_utf8(&body).unwrap(),
        r#"{"user_id":101,"name":"Deepanshu","email":"d@x.com"}"#
    );
    assert!(outcome.metadata.healed);
    assert!(!outcome.metadata.from_cache);
    assert_eq!(outcome.metadata.mapping_version, 1);
    // minimum aggregation
    assert_eq!(outcome.metadata.confidence, Some(0.85));

    let stats = engine.session_stats();
    assert_eq!(stats.session_healings, 1);
    assert!((stats.total_cost_usd - 0.002).abs() < 1e-9);
    assert!(!stats.pending_approval);
    assert_eq!(engine.cache().len(), 1);
    assert_eq!(backend.calls(), 1);
    assert!(engine.attempts().is_empty());

    let kinds: Vec<ThoughtType> = engine.fabric().history(50).iter().map(|t| t.kind).collect();
    assert_eq!(kinds.first(), Some(&ThoughtType::Alert));
    assert_eq!(kinds.last(), Some(&ThoughtType::Success));
    assert!(kinds.contains(&ThoughtType::Patching));
    assert!(kinds.contains(&ThoughtType::Retrying));
}

#[tokio::test]
async fn identical_drift_hits_cache() {
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()).with_cost(0.002));
    let engine = engine(Arc::clone(&backend), EngineConfig::default());

    let first = engine.heal("/api/users/101", DRIFTED_USER).await.unwrap();
    let cost_after_first = engine.session_stats().total_cost_usd;
    let seen = engine.fabric().history(50).len();

    // same shape, different field order
    let reordered = br#"{"email_address": "d@x.com", "full_name": "Deepanshu", "uid": 101}"#;
    let second = engine.heal("/api/users/101", reordered).await.unwrap();

    assert!(second.metadata.from_cache);
    assert_eq!(second.metadata.mapping_version, 1);
    assert_eq!(second.body, first.body);
    assert_eq!(engine.session_stats().total_cost_usd, cost_after_first);
    assert_eq!(engine.session_stats().session_healings, 1);
    assert_eq!(backend.calls(), 1);

    let history = engine.fabric().history(50);
    let new_thoughts = &history[seen..];
    assert!(!new_thoughts.is_empty());
    assert!(new_thoughts
        .iter()
        .all(|t| t.kind != ThoughtType::Analyzing && t.kind != ThoughtType::Scanning));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_drift_runs_one_inference() {
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()).with_delay(Duration::from_millis(100)));
    let engine = engine(Arc::clone(&backend), EngineConfig::default());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.heal("/api/users/101", DRIFTED_USER).await })
        })
        .collect();

    let mut bodies = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.metadata.healed);
        bodies.push(outcome.body.unwrap());
    }

    assert_eq!(backend.calls(), 1);
    assert_eq!(engine.session_stats().session_healings, 1);
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn below_threshold_awaits_approval() {
    let backend = Arc::new(StaticBackend::new(vec![Correspondence::new("uid", "user_id", 0.65)]));
    let engine = engine(Arc::clone(&backend), gated(0.7, Duration::from_secs(60)));

    let request = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.heal("/api/users/1", br#"{"uid": 1, "name": "a"}"#).await })
    };
    wait_for_pending(&engine).await;

    let attempts = engine.attempts().snapshot();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::AwaitingApproval);
    assert!(engine.session_stats().pending_approval);
    let waiting = engine.fabric().history(1);
    assert_eq!(waiting[0].kind, ThoughtType::Waiting);
    assert!(waiting[0].requires_approval);

    engine.submit_decision(true).unwrap();
    let outcome = request.await.unwrap().unwrap();
    assert!(outcome.metadata.healed);
    assert!(!engine.session_stats().pending_approval);
}

#[tokio::test]
async fn above_threshold_auto_applies() {
    let backend = Arc::new(StaticBackend::new(vec![Correspondence::new("uid", "user_id", 0.75)]));
    let engine = engine(backend, gated(0.7, Duration::from_secs(60)));

    let outcome = engine.heal("/api/users/1", br#"{"uid": 1, "name": "a"}"#).await.unwrap();
    assert!(outcome.metadata.healed);
    assert!(!engine.gate().has_pending());
    assert!(engine
        .fabric()
        .history(50)
        .iter()
        .all(|t| t.kind != ThoughtType::Waiting));
}

#[tokio::test]
async fn rejection_serves_unhealed_body() {
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()));
    let engine = engine(backend, gated(0.9, Duration::from_secs(60)));

    let request = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.heal("/api/users/101", DRIFTED_USER).await })
    };
    wait_for_pending(&engine).await;

    let pending = engine.gate().pending().unwrap();
    assert_eq!(pending.confidence, 0.85);

    engine.submit_decision(false).unwrap();
    let outcome = request.await.unwrap().unwrap();

    assert!(outcome.body.is_none());
    assert!(!outcome.metadata.healed);
    assert!(engine.cache().is_empty());
    assert_eq!(engine.session_stats().session_healings, 0);
    assert!(matches!(
        engine.submit_decision(true),
        Err(suture_core::SutureError::ApprovalWithoutPending)
    ));
}

#[tokio::test(start_paused = true)]
async fn undecided_approval_times_out_for_every_waiter() {
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()));
    let engine = engine(backend, gated(0.9, Duration::from_secs(30)));

    let requests: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.heal("/api/users/101", DRIFTED_USER).await })
        })
        .collect();

    for request in requests {
        let outcome = request.await.unwrap().unwrap();
        assert!(outcome.body.is_none());
    }

    assert!(!engine.gate().has_pending());
    assert!(engine.cache().is_empty());
    let last = engine.fabric().history(1);
    assert_eq!(last[0].kind, ThoughtType::Failure);
    assert!(last[0].message.contains("timed out"));
}

#[tokio::test]
async fn list_responses_heal_every_item() {
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()));
    let engine = engine(backend, EngineConfig::default());

    let body = br#"[{"uid": 1, "full_name": "A"}, {"uid": 2, "full_name": "B", "email_address": "b@x.io"}]"#;
    let outcome = engine.heal("/api/users", body).await.unwrap();
    let healed: Value = serde_json::from_slice(&outcome.body.unwrap()).unwrap();
    assert_eq!(
        healed,
        json!([
            {"user_id": 1, "name": "A"},
            {"user_id": 2, "name": "B", "email": "b@x.io"}
        ])
    );
}

#[tokio::test]
async fn mixed_list_keeps_conforming_items() {
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()));
    let engine = engine(backend, EngineConfig::default());

    let body = br#"[{"user_id": 1, "name": "A"}, {"uid": 2, "full_name": "B", "email_address": "b@x.io"}]"#;
    let outcome = engine.heal("/api/users", body).await.unwrap();
    assert!(outcome.metadata.healed);
    let healed: Value = serde_json::from_slice(&outcome.body.unwrap()).unwrap();
    assert_eq!(
        healed,
        json!([
            {"user_id": 1, "name": "A"},
            {"user_id": 2, "name": "B", "email": "b@x.io"}
        ])
    );
}

#[tokio::test]
async fn disabling_approval_does_not_release_pending_attempt() {
    let backend = Arc::new(StaticBackend::new(vec![Correspondence::new("uid", "user_id", 0.65)]));
    let engine = engine(Arc::clone(&backend), gated(0.7, Duration::from_secs(60)));

    let request = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.heal("/api/users/1", br#"{"uid": 1, "name": "a"}"#).await })
    };
    wait_for_pending(&engine).await;

    let policy = engine.set_human_in_loop(false, 0.7);
    assert!(!policy.enabled);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!request.is_finished());
    assert!(engine.gate().has_pending());
    assert_eq!(engine.attempts().snapshot()[0].status, AttemptStatus::AwaitingApproval);

    // a new fingerprint follows the new policy while the old one still waits
    let other = engine
        .heal("/api/users/2", br#"{"uid": 2, "name": "b", "nickname": "bee"}"#)
        .await
        .unwrap();
    assert!(other.metadata.healed);
    assert!(engine.gate().has_pending());

    engine.submit_decision(true).unwrap();
    let outcome = request.await.unwrap().unwrap();
    assert!(outcome.metadata.healed);
    assert_eq!(backend.calls(), 2);
    assert!(engine
        .fabric()
        .history(50)
        .iter()
        .any(|t| t.kind == ThoughtType::Info && t.message.contains("disabled")));
}

#[tokio::test]
async fn reinference_after_invalidate_bumps_mapping_version() {
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()));
    let engine = engine(Arc::clone(&backend), EngineConfig::default());

    let first = engine.heal("/api/users/101", DRIFTED_USER).await.unwrap();
    assert_eq!(first.metadata.mapping_version, 1);
    let fingerprint = first.metadata.fingerprint.expect("healed response carries its fingerprint");

    assert!(engine.invalidate_mapping(fingerprint));
    assert!(!engine.invalidate_mapping(fingerprint));

    let second = engine.heal("/api/users/101", DRIFTED_USER).await.unwrap();
    assert!(second.metadata.healed);
    assert!(!second.metadata.from_cache);
    assert_eq!(second.metadata.mapping_version, 2);
    assert_eq!(second.metadata.fingerprint, Some(fingerprint));
    assert_eq!(backend.calls(), 2);

    let third = engine.heal("/api/users/101", DRIFTED_USER).await.unwrap();
    assert!(third.metadata.from_cache);
    assert_eq!(third.metadata.mapping_version, 2);
    assert_eq!(third.body, second.body);
}

// ============================================================================
// Through the proxy
// ============================================================================

async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let (status, body): (StatusCode, &[u8]) = match req.uri().path() {
                        "/api/users/101" => (StatusCode::OK, DRIFTED_USER),
                        "/api/broken" => (StatusCode::INTERNAL_SERVER_ERROR, br#"{"detail": "boom"}"#),
                        _ => (StatusCode::NOT_FOUND, br#"{"detail": "missing"}"#),
                    };
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .header("content-type", "application/json")
                            .body(Full::new(Bytes::from_static(body)))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });
    addr
}

async fn spawn_proxy(upstream: SocketAddr, engine: HealingEngine) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(ProxyState::new(
        ProxyConfig {
            listen_addr: addr,
            target_url: format!("http://{upstream}").parse().unwrap(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        },
        Arc::new(HealingMiddleware::new(engine)),
        Arc::new(ProxyMetrics::default()),
    ));
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

async fn get(addr: SocketAddr, path: &str) -> (Response<()>, Bytes) {
    let client = proxy::upstream_client();
    let req = Request::get(format!("http://{addr}{path}"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    let (parts, body) = resp.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (Response::from_parts(parts, ()), bytes)
}

#[tokio::test]
async fn proxy_heals_and_marks_responses() {
    let upstream = spawn_upstream().await;
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()));
    let engine = engine(backend, EngineConfig::default());
    let proxy_addr = spawn_proxy(upstream, engine.clone()).await;

    let (resp, body) = get(proxy_addr, "/api/users/101").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[proxy::HEADER_HEALED], "true");
    assert_eq!(resp.headers()[proxy::HEADER_FROM_CACHE], "false");
    assert_eq!(resp.headers()[proxy::HEADER_MAPPING_VERSION], "1");
    let healed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(healed, json!({"user_id": 101, "name": "Deepanshu", "email": "d@x.com"}));

    let (resp, _) = get(proxy_addr, "/api/users/101").await;
    assert_eq!(resp.headers()[proxy::HEADER_FROM_CACHE], "true");

    let (resp, body) = get(proxy_addr, "/api/broken").await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers()[proxy::HEADER_HEALED], "false");
    assert_eq!(&body[..], br#"{"detail": "boom"}"#);
    assert_eq!(engine.session_stats().session_healings, 1);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    // bind then drop to get a port nobody listens on
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let backend = Arc::new(StaticBackend::new(renamed_user_mapping()));
    let proxy_addr = spawn_proxy(dead, engine(backend, EngineConfig::default())).await;

    let (resp, _) = get(proxy_addr, "/api/users/101").await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(resp.headers()[proxy::HEADER_ERROR], "true");
}
