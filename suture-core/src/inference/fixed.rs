//! Deterministic backend returning preset correspondences.
//!
//! Used by tests, benches and demos where inference must be repeatable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::SutureError;
use crate::mapping::{CandidateMapping, Correspondence};
use crate::schema::{ExpectedSchema, ObservedShape};

use super::{InferFuture, MappingBackend};

pub struct StaticBackend {
    correspondences: Vec<Correspondence>,
    cost_usd: f64,
    delay: Option<Duration>,
    error: Option<String>,
    analysis: Option<String>,
    calls: AtomicU64,
}

impl StaticBackend {
    pub fn new(correspondences: Vec<Correspondence>) -> Self {
        Self {
            correspondences,
            cost_usd: 0.0,
            delay: None,
            error: None,
            analysis: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Backend whose every call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Backend whose calls complete, and are billed, but propose nothing.
    pub fn unhealable(analysis: &str) -> Self {
        Self {
            analysis: Some(analysis.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    /// Sleep before answering, to simulate a slow reasoning call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MappingBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    fn infer<'a>(&'a self, schema: &'a ExpectedSchema, shape: &'a ObservedShape) -> InferFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.error {
                return Err(SutureError::InferenceFailed(message.clone()));
            }

            let resolved: Vec<&str> = self.correspondences.iter().map(|c| c.target.as_str()).collect();
            let unresolved = schema
                .fields
                .iter()
                .filter(|f| f.required && !shape.contains(&f.name) && !resolved.contains(&f.name.as_ref()))
                .map(|f| f.name.to_string())
                .collect();

            Ok(CandidateMapping {
                correspondences: self.correspondences.clone(),
                unresolved,
                cost_usd: self.cost_usd,
                analysis: self
                    .analysis
                    .clone()
                    .unwrap_or_else(|| format!("Preset mapping with {} field(s)", self.correspondences.len())),
            })
        })
    }
}
