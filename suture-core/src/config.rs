//! Gateway configuration from the environment.
//!
//! Each setting is read from its environment variable (an optional `.env`
//! file is merged in by `main` via `dotenvy`) and falls back to a typed
//! default.
//! Values that are present but unparseable fail startup with
//! [`SutureError::Config`].

use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use http::Uri;

use crate::error::{Result, SutureError};
use crate::events::FabricConfig;
use crate::healer::EngineConfig;
use crate::inference::LlmConfig;
use crate::mapping::ConfidenceAggregation;
use crate::runtime::RuntimeConfig;

pub const ENV_LISTEN_ADDR: &str = "LISTEN_ADDR";
pub const ENV_CONTROL_ADDR: &str = "CONTROL_ADDR";
pub const ENV_TARGET_URL: &str = "TARGET_URL";
pub const ENV_WORKER_THREADS: &str = "WORKER_THREADS";
pub const ENV_CPU_PINNING: &str = "CPU_PINNING";
pub const ENV_UPSTREAM_TIMEOUT_MS: &str = "UPSTREAM_TIMEOUT_MS";
pub const ENV_MAX_BODY_BYTES: &str = "MAX_BODY_BYTES";
pub const ENV_ENABLE_HEALING: &str = "ENABLE_HEALING";
pub const ENV_HUMAN_IN_LOOP: &str = "HUMAN_IN_LOOP";
pub const ENV_APPROVAL_THRESHOLD: &str = "APPROVAL_THRESHOLD";
pub const ENV_APPROVAL_TIMEOUT_SECS: &str = "APPROVAL_TIMEOUT_SECS";
pub const ENV_MIN_FIELD_CONFIDENCE: &str = "MIN_FIELD_CONFIDENCE";
pub const ENV_CONFIDENCE_AGGREGATION: &str = "CONFIDENCE_AGGREGATION";
pub const ENV_TRACE_CAPACITY: &str = "TRACE_CAPACITY";
pub const ENV_SUBSCRIBER_QUEUE: &str = "SUBSCRIBER_QUEUE";
pub const ENV_REPLAY_ON_CONNECT: &str = "REPLAY_ON_CONNECT";
pub const ENV_CACHE_CAPACITY: &str = "CACHE_CAPACITY";
pub const ENV_SCHEMA_FILE: &str = "SCHEMA_FILE";
pub const ENV_INFERENCE_BACKEND: &str = "INFERENCE_BACKEND";
pub const ENV_LLM_API_KEY: &str = "LLM_API_KEY";
pub const ENV_LLM_MODEL: &str = "LLM_MODEL";
pub const ENV_LLM_BASE_URL: &str = "LLM_BASE_URL";
pub const ENV_CONTROL_API_KEY: &str = "CONTROL_API_KEY";

/// Which reasoning backend proposes mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Heuristic,
    Llm,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heuristic" => Ok(BackendKind::Heuristic),
            "llm" => Ok(BackendKind::Llm),
            other => Err(format!("unknown backend '{other}', expected heuristic or llm")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub target_url: Uri,
    pub runtime: RuntimeConfig,
    pub upstream_timeout: Duration,
    pub max_body_bytes: usize,
    pub enable_healing: bool,
    pub engine: EngineConfig,
    pub schema_file: Option<PathBuf>,
    pub backend: BackendKind,
    pub llm: LlmConfig,
    pub control_api_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 8080).into(),
            control_addr: ([127, 0, 0, 1], 8081).into(),
            target_url: Uri::from_static("http://127.0.0.1:9090"),
            runtime: RuntimeConfig::default(),
            upstream_timeout: Duration::from_millis(30_000),
            max_body_bytes: 10 * 1024 * 1024,
            enable_healing: true,
            engine: EngineConfig::default(),
            schema_file: None,
            backend: BackendKind::Heuristic,
            llm: LlmConfig::default(),
            control_api_key: None,
        }
    }
}

impl GatewayConfig {
    /// Read the process environment. The binary loads `.env` into it before
    /// the tracing subscriber starts.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let vars = Vars(&lookup);

        let runtime = RuntimeConfig {
            worker_threads: vars.parse(ENV_WORKER_THREADS, d.runtime.worker_threads)?,
            enable_cpu_pinning: vars.flag(ENV_CPU_PINNING, d.runtime.enable_cpu_pinning)?,
            ..d.runtime
        };
        if runtime.worker_threads == 0 {
            return Err(SutureError::config(ENV_WORKER_THREADS, "must be at least 1"));
        }

        let aggregation = match vars.get(ENV_CONFIDENCE_AGGREGATION) {
            None => d.engine.aggregation,
            Some(raw) => ConfidenceAggregation::parse(&raw)
                .ok_or_else(|| SutureError::config(ENV_CONFIDENCE_AGGREGATION, format!("'{raw}' is not min or mean")))?,
        };

        let engine = EngineConfig {
            human_in_loop: vars.flag(ENV_HUMAN_IN_LOOP, d.engine.human_in_loop)?,
            approval_threshold: vars.unit(ENV_APPROVAL_THRESHOLD, d.engine.approval_threshold)?,
            approval_timeout: Duration::from_secs(
                vars.parse(ENV_APPROVAL_TIMEOUT_SECS, d.engine.approval_timeout.as_secs())?,
            ),
            min_field_confidence: vars.unit(ENV_MIN_FIELD_CONFIDENCE, d.engine.min_field_confidence)?,
            aggregation,
            cache_capacity: vars.parse(ENV_CACHE_CAPACITY, d.engine.cache_capacity)?,
            fabric: FabricConfig {
                trace_capacity: vars.parse(ENV_TRACE_CAPACITY, d.engine.fabric.trace_capacity)?,
                subscriber_queue: vars.parse(ENV_SUBSCRIBER_QUEUE, d.engine.fabric.subscriber_queue)?,
                replay_on_connect: vars.parse(ENV_REPLAY_ON_CONNECT, d.engine.fabric.replay_on_connect)?,
            },
        };

        let llm = LlmConfig {
            api_key: vars.get(ENV_LLM_API_KEY).unwrap_or_default(),
            model: vars.get(ENV_LLM_MODEL).unwrap_or(d.llm.model.clone()),
            base_url: vars.get(ENV_LLM_BASE_URL).unwrap_or(d.llm.base_url.clone()),
            ..d.llm
        };

        let target_url: Uri = vars.parse(ENV_TARGET_URL, d.target_url)?;
        if target_url.authority().is_none() {
            return Err(SutureError::config(ENV_TARGET_URL, "must be an absolute http URL"));
        }

        Ok(Self {
            listen_addr: vars.parse(ENV_LISTEN_ADDR, d.listen_addr)?,
            control_addr: vars.parse(ENV_CONTROL_ADDR, d.control_addr)?,
            target_url,
            runtime,
            upstream_timeout: Duration::from_millis(vars.parse(ENV_UPSTREAM_TIMEOUT_MS, 30_000u64)?),
            max_body_bytes: vars.parse(ENV_MAX_BODY_BYTES, d.max_body_bytes)?,
            enable_healing: vars.flag(ENV_ENABLE_HEALING, d.enable_healing)?,
            engine,
            schema_file: vars.get(ENV_SCHEMA_FILE).map(PathBuf::from),
            backend: vars.parse(ENV_INFERENCE_BACKEND, d.backend)?,
            llm,
            control_api_key: vars.get(ENV_CONTROL_API_KEY),
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| SutureError::config(key, format!("'{raw}': {e}"))),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(SutureError::config(key, format!("'{v}' is not a boolean"))),
            },
        }
    }

    /// Float in [0, 1].
    fn unit(&self, key: &'static str, default: f32) -> Result<f32> {
        let value: f32 = self.parse(key, default)?;
        if !(0.0..=1.0).contains(&value) {
            return Err(SutureError::config(key, format!("{value} is outside [0, 1]")));
        }
        Ok(value)
    }
}
