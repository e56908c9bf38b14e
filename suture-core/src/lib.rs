//! Suture Core - schema-healing gateway
//!
//! Sits between a client and an upstream JSON API. When an upstream
//! response drifts from the shape the client expects, the gateway infers a
//! field mapping, gates it on confidence (optionally on a human decision),
//! caches it by structural fingerprint and rewrites the response. Every
//! step is published as a `Thought` on a live event stream.
//!
//! - **Lock-free reads**: the schema registry uses ArcSwap
//! - **One attempt per fingerprint**: concurrent drifted requests coalesce
//! - **Fail closed**: rejected or timed-out approvals serve the raw body

#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::unnecessary_to_owned)]

pub mod approval;
pub mod attempt;
pub mod cache;
pub mod config;
pub mod control;
pub mod drift;
pub mod error;
pub mod events;
pub mod healer;
pub mod inference;
pub mod mapping;
pub mod middleware;
pub mod proxy;
pub mod runtime;
pub mod schema;
pub mod sse;
pub mod transform;

pub use error::{Result, SutureError};
pub use healer::{EngineConfig, HealOutcome, HealingEngine};
pub use middleware::{MiddlewareContext, ResponseMiddleware};
pub use proxy::{ProxyConfig, ProxyServer, ProxyState};
pub use runtime::build_runtime;
pub use schema::SchemaRegistry;
