//! Suture - schema-healing gateway
//!
//! # Usage
//!
//! ```bash
//! # Defaults: proxy on 127.0.0.1:8080 -> 127.0.0.1:9090, control on 8081
//! suture-core
//!
//! # Point at another upstream, require approval below 80% confidence
//! TARGET_URL=http://api.internal:80 HUMAN_IN_LOOP=true APPROVAL_THRESHOLD=0.8 suture-core
//!
//! # LLM-backed inference with JSON logs
//! INFERENCE_BACKEND=llm LLM_API_KEY=sk-... LOG_FORMAT=json suture-core
//! ```

use std::sync::Arc;

use suture_core::config::{BackendKind, GatewayConfig};
use suture_core::control::{ControlConfig, ControlServer, ControlState};
use suture_core::healer::HealingEngine;
use suture_core::inference::{HeuristicBackend, LlmBackend, MappingBackend};
use suture_core::middleware::{HealingMiddleware, PassThroughMiddleware, ResponseMiddleware};
use suture_core::proxy::{ProxyConfig, ProxyMetrics, ProxyServer, ProxyState};
use suture_core::runtime::build_runtime;
use suture_core::schema::SchemaRegistry;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

fn main() {
    // .env may carry RUST_LOG, so load it before the subscriber
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "Loaded .env");
    }

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };

    info!(
        worker_threads = config.runtime.worker_threads,
        cpu_pinning = config.runtime.enable_cpu_pinning,
        "Initializing Suture runtime"
    );

    let runtime = match build_runtime(config.runtime.clone()) {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Err(e) = run_gateway(config).await {
            error!(error = %e, "Gateway failed");
            std::process::exit(1);
        }
    });
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("suture_core=debug,info"));
    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_gateway(config: GatewayConfig) -> suture_core::Result<()> {
    let registry = match &config.schema_file {
        Some(path) => {
            info!(path = %path.display(), "Loading expected schemas");
            SchemaRegistry::from_file(path)?
        }
        None => SchemaRegistry::with_defaults(),
    };

    let backend: Arc<dyn MappingBackend> = match config.backend {
        BackendKind::Heuristic => Arc::new(HeuristicBackend::new()),
        BackendKind::Llm => Arc::new(LlmBackend::new(config.llm.clone())?),
    };

    let engine = HealingEngine::new(config.engine.clone(), Arc::new(registry), backend);
    let metrics = Arc::new(ProxyMetrics::default());

    let middleware: Arc<dyn ResponseMiddleware> = if config.enable_healing {
        Arc::new(HealingMiddleware::new(engine.clone()))
    } else {
        warn!("Healing disabled, proxying bodies unchanged");
        Arc::new(PassThroughMiddleware)
    };

    let control = ControlServer::new(ControlState::new(
        ControlConfig {
            listen_addr: config.control_addr,
            api_key: config.control_api_key.clone(),
            target_url: config.target_url.clone(),
        },
        engine,
        Arc::clone(&metrics),
    ));
    tokio::spawn(async move {
        if let Err(e) = control.run().await {
            error!(error = %e, "Control plane server failed");
        }
    });

    let proxy = ProxyServer::new(ProxyState::new(
        ProxyConfig {
            listen_addr: config.listen_addr,
            target_url: config.target_url.clone(),
            timeout: config.upstream_timeout,
            max_body_size: config.max_body_bytes,
            enable_suture_headers: true,
        },
        middleware,
        metrics,
    ));

    print_banner(&config);
    proxy.run().await
}

fn print_banner(config: &GatewayConfig) {
    eprintln!(
        r#"
  ┌──────────────────────────────────────────────┐
  │  SUTURE  schema-healing gateway              │
  └──────────────────────────────────────────────┘
    proxy    {} -> {}
    control  {}
    backend  {:?}, human-in-loop {}
"#,
        config.listen_addr,
        config.target_url,
        config.control_addr,
        config.backend,
        if config.engine.human_in_loop { "on" } else { "off" },
    );
}
