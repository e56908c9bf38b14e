//! Mapping inference.
//!
//! - `heuristic`: string-similarity ensemble, zero cost
//! - `llm`: OpenAI-compatible chat-completions backend
//! - `fixed`: deterministic backend with preset correspondences
//! - `synonym`: field-name synonym dictionary used by the heuristic
//!
//! Backends only produce hypotheses. [`InferenceEngine`] wraps one backend
//! and owns the shared contract: the `analyzing → scanning → hypothesis`
//! trace, charging each call's cost exactly once, and discarding
//! correspondences that cannot be applied.

pub mod fixed;
pub mod heuristic;
pub mod llm;
pub mod synonym;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::drift::DriftReport;
use crate::error::{Result, SutureError};
use crate::events::{EventFabric, Thought, ThoughtType};
use crate::mapping::{CandidateMapping, Correspondence};
use crate::schema::{ExpectedSchema, ObservedShape};

pub use fixed::StaticBackend;
pub use heuristic::HeuristicBackend;
pub use llm::{LlmBackend, LlmConfig};

/// Boxed future returned by [`MappingBackend::infer`].
pub type InferFuture<'a> = Pin<Box<dyn Future<Output = Result<CandidateMapping>> + Send + 'a>>;

/// A source of mapping hypotheses.
///
/// Implementations report their own per-call cost in
/// [`CandidateMapping::cost_usd`]; an empty correspondence list means the
/// backend could not heal the drift. A call that was billed must return
/// `Ok`, even when its answer is unusable, so the cost is charged; an `Err`
/// is treated as an unbilled call.
pub trait MappingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn infer<'a>(&'a self, schema: &'a ExpectedSchema, shape: &'a ObservedShape) -> InferFuture<'a>;
}

/// Backend wrapper enforcing the trace and cost contract.
pub struct InferenceEngine {
    backend: Arc<dyn MappingBackend>,
    fabric: Arc<EventFabric>,
    min_field_confidence: f32,
    calls: AtomicU64,
}

impl InferenceEngine {
    pub fn new(backend: Arc<dyn MappingBackend>, fabric: Arc<EventFabric>, min_field_confidence: f32) -> Self {
        Self {
            backend,
            fabric,
            min_field_confidence: min_field_confidence.clamp(0.0, 1.0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Backend invocations so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Produce a usable hypothesis for one drift.
    ///
    /// Fails with `InferenceFailed` if the backend errors or nothing
    /// applicable survives filtering.
    pub async fn infer(&self, schema: &ExpectedSchema, report: &DriftReport) -> Result<CandidateMapping> {
        let unsatisfied: Vec<&str> = report.unsatisfied().collect();
        self.fabric.emit(
            Thought::new(
                ThoughtType::Analyzing,
                format!(
                    "Analyzing drift against {}... Missing/invalid fields: {}",
                    schema.id,
                    unsatisfied.join(", ")
                ),
            )
            .with_details(json!({
                "schema": schema.id.as_ref(),
                "missing": report.missing,
                "mistyped": report.mistyped,
            })),
        );

        let available: Vec<&str> = report.shape.names().collect();
        self.fabric.emit(
            Thought::new(
                ThoughtType::Scanning,
                format!("Scanning response payload... Found fields: {}", available.join(", ")),
            )
            .with_details(json!({ "available_fields": available })),
        );

        self.calls.fetch_add(1, Ordering::Relaxed);
        let raw = self
            .backend
            .infer(schema, &report.shape)
            .await
            .map_err(|e| match e {
                SutureError::InferenceFailed(_) => e,
                other => SutureError::InferenceFailed(other.to_string()),
            })?;

        self.fabric.charge(raw.cost_usd);
        info!(
            backend = self.backend.name(),
            proposed = raw.correspondences.len(),
            cost_usd = raw.cost_usd,
            "Backend returned hypothesis"
        );

        if raw.correspondences.is_empty() {
            let reason = if raw.analysis.is_empty() {
                "backend proposed no mappings".to_string()
            } else {
                raw.analysis.clone()
            };
            return Err(SutureError::InferenceFailed(format!("cannot heal: {reason}")));
        }

        let analysis = if raw.analysis.is_empty() {
            "Field names changed".to_string()
        } else {
            raw.analysis.clone()
        };
        self.fabric.emit(
            Thought::new(ThoughtType::Hypothesis, format!("Hypothesis: {analysis}"))
                .with_cost(raw.cost_usd),
        );

        let candidate = self.filter(schema, &report.shape, raw);
        if candidate.is_empty() {
            return Err(SutureError::InferenceFailed(
                "no valid mappings could be generated".to_string(),
            ));
        }
        Ok(candidate)
    }

    /// Keep correspondences that can be applied: known target, present
    /// source, confidence at or above the floor, one source per target.
    fn filter(&self, schema: &ExpectedSchema, shape: &ObservedShape, raw: CandidateMapping) -> CandidateMapping {
        let mut best: HashMap<String, Correspondence> = HashMap::new();
        let mut unresolved = raw.unresolved;

        for corr in raw.correspondences {
            if !schema.contains(&corr.target) || !shape.contains(&corr.source) {
                debug!(source = %corr.source, target = %corr.target, "Discarding inapplicable correspondence");
                if schema.contains(&corr.target) {
                    unresolved.push(corr.target);
                }
                continue;
            }

            self.fabric.emit(
                Thought::new(
                    ThoughtType::Scanning,
                    format!("Mapping: '{}' -> '{}'", corr.source, corr.target),
                )
                .with_confidence(corr.confidence)
                .with_details(json!({
                    "source": corr.source,
                    "target": corr.target,
                    "transform": corr.transform,
                })),
            );

            if corr.confidence < self.min_field_confidence {
                self.fabric.emit(Thought::new(
                    ThoughtType::Info,
                    format!(
                        "Skipping low-confidence mapping {} ({:.0}%)",
                        corr,
                        corr.confidence * 100.0
                    ),
                ));
                unresolved.push(corr.target);
                continue;
            }

            match best.get(&corr.target) {
                Some(existing) if existing.confidence >= corr.confidence => {}
                _ => {
                    best.insert(corr.target.clone(), corr);
                }
            }
        }

        // expected-schema order
        let correspondences: Vec<Correspondence> = schema
            .field_names()
            .filter_map(|name| best.remove(name))
            .collect();
        unresolved.retain(|t| !correspondences.iter().any(|c| &c.target == t));
        unresolved.sort();
        unresolved.dedup();

        CandidateMapping {
            correspondences,
            unresolved,
            cost_usd: raw.cost_usd,
            analysis: raw.analysis,
        }
    }
}
