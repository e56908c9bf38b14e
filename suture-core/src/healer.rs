//! Healing orchestrator.
//!
//! Per response: detect drift, consult the mapping cache, and on a miss
//! join or start the single attempt for that fingerprint. The attempt runs
//! on its own task so a disconnecting client cannot cancel work other
//! requests are waiting on.
//!
//! ```text
//! body ─► detect ─► no drift ──────────────────────────► pass through
//!            │
//!            └► drift ─► fingerprint ─► cache hit ─────► apply (from_cache)
//!                                   │
//!                                   └► miss ─► attempt ─► infer ─► gate ─► store ─► apply
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::approval::{ApprovalGate, ApprovalOutcome, ApprovalPolicy, GateDecision, PendingInfo};
use crate::attempt::{AttemptLease, AttemptOutcome, AttemptRegistry, AttemptSnapshot, AttemptStatus, Joined};
use crate::cache::{CacheStats, MappingCache};
use crate::drift::{self, Drift, DriftReport};
use crate::error::{Result, SutureError};
use crate::events::{EventFabric, FabricConfig, SessionStats, Thought, ThoughtType};
use crate::inference::{InferenceEngine, MappingBackend};
use crate::mapping::{ConfidenceAggregation, FieldMapping};
use crate::schema::{ExpectedSchema, SchemaFingerprint, SchemaRegistry};
use crate::transform::{self, HealingMetadata};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub human_in_loop: bool,
    pub approval_threshold: f32,
    pub approval_timeout: Duration,
    pub min_field_confidence: f32,
    pub aggregation: ConfidenceAggregation,
    pub cache_capacity: usize,
    pub fabric: FabricConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            human_in_loop: false,
            approval_threshold: 0.7,
            approval_timeout: Duration::from_secs(60),
            min_field_confidence: 0.5,
            aggregation: ConfidenceAggregation::Minimum,
            cache_capacity: 1024,
            fabric: FabricConfig::default(),
        }
    }
}

/// Result of running one body through the engine.
#[derive(Debug, Clone)]
pub struct HealOutcome {
    /// Rewritten body; `None` means serve the upstream body unchanged
    pub body: Option<Bytes>,
    pub metadata: HealingMetadata,
}

impl HealOutcome {
    fn passthrough(start: Instant) -> Self {
        Self {
            body: None,
            metadata: HealingMetadata::passthrough(elapsed_us(start)),
        }
    }

    /// Body to send to the client.
    pub fn into_body(self, original: Bytes) -> Bytes {
        self.body.unwrap_or(original)
    }
}

/// Everything the control plane reports.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    #[serde(flatten)]
    pub session: SessionStats,
    pub pending: Option<PendingInfo>,
    pub human_in_loop: ApprovalPolicy,
    pub aggregation: ConfidenceAggregation,
    pub backend: &'static str,
    pub inference_calls: u64,
    pub cache: CacheStats,
    pub in_flight: Vec<AttemptSnapshot>,
}

struct EngineInner {
    registry: Arc<SchemaRegistry>,
    cache: MappingCache,
    inference: InferenceEngine,
    gate: ApprovalGate,
    attempts: Arc<AttemptRegistry>,
    fabric: Arc<EventFabric>,
    aggregation: ConfidenceAggregation,
}

/// Shared healing engine. Cheap to clone.
#[derive(Clone)]
pub struct HealingEngine {
    inner: Arc<EngineInner>,
}

impl HealingEngine {
    pub fn new(config: EngineConfig, registry: Arc<SchemaRegistry>, backend: Arc<dyn MappingBackend>) -> Self {
        let fabric = Arc::new(EventFabric::new(config.fabric));
        let inference = InferenceEngine::new(backend, Arc::clone(&fabric), config.min_field_confidence);
        let gate = ApprovalGate::new(
            ApprovalPolicy {
                enabled: config.human_in_loop,
                threshold: config.approval_threshold.clamp(0.0, 1.0),
            },
            config.approval_timeout,
        );

        info!(
            backend = inference.backend_name(),
            human_in_loop = config.human_in_loop,
            threshold = config.approval_threshold,
            aggregation = ?config.aggregation,
            routes = registry.len(),
            "Healing engine initialized"
        );

        Self {
            inner: Arc::new(EngineInner {
                registry,
                cache: MappingCache::new(config.cache_capacity),
                inference,
                gate,
                attempts: Arc::new(AttemptRegistry::new()),
                fabric,
                aggregation: config.aggregation,
            }),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &MappingCache {
        &self.inner.cache
    }

    pub fn fabric(&self) -> &Arc<EventFabric> {
        &self.inner.fabric
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.inner.gate
    }

    pub fn attempts(&self) -> &AttemptRegistry {
        &self.inner.attempts
    }

    /// Heal an upstream body served for `route`.
    ///
    /// Routes without a registered schema pass through unparsed.
    #[instrument(skip(self, body), fields(len = body.len()))]
    pub async fn heal(&self, route: &str, body: &[u8]) -> Result<HealOutcome> {
        let start = Instant::now();
        let Some(schema) = self.inner.registry.resolve(route) else {
            return Ok(HealOutcome::passthrough(start));
        };

        let value: Value = serde_json::from_slice(body).map_err(|e| SutureError::MalformedBody(e.to_string()))?;

        let report = match drift::detect(&schema, &value) {
            Drift::None => return Ok(HealOutcome::passthrough(start)),
            Drift::Unsupported => {
                debug!(route, "Body is not an object or list of objects, passing through");
                return Ok(HealOutcome::passthrough(start));
            }
            Drift::Drifted(report) => report,
        };

        let fingerprint = SchemaFingerprint::compute(&report.shape, &schema.id);
        debug!(route, fingerprint = %fingerprint, missing = ?report.missing, "Drift detected");

        match self.inner.cache.lookup(fingerprint) {
            Ok(Some(mapping)) => {
                self.inner.fabric.emit(
                    Thought::new(
                        ThoughtType::Success,
                        format!("Schema healed from cache (mapping v{})", mapping.version),
                    )
                    .with_confidence(mapping.confidence)
                    .with_details(json!({
                        "endpoint": route,
                        "fingerprint": fingerprint,
                        "cached": true,
                    })),
                );
                return self.apply(&schema, &mapping, &value, true, start);
            }
            Ok(None) => {}
            Err(e) => warn!(route, error = %e, "Cached mapping unusable, re-inferring"),
        }

        let value = Arc::new(value);
        let attempt = match self.inner.attempts.join(fingerprint, &schema.id, route) {
            Joined::Follower(attempt) => attempt,
            Joined::Leader(lease) => {
                // an attempt may have finished between the lookup and the join
                if let Some(mapping) = self.inner.cache.peek(fingerprint) {
                    lease.finish(AttemptOutcome::Healed(Arc::clone(&mapping)));
                    return self.apply(&schema, &mapping, &value, true, start);
                }
                let attempt = Arc::clone(lease.attempt());
                let engine = self.clone();
                let schema = Arc::clone(&schema);
                let sample = Arc::clone(&value);
                let route = route.to_string();
                tokio::spawn(async move {
                    engine.run_attempt(lease, schema, report, sample, route).await;
                });
                attempt
            }
        };

        match attempt.wait().await {
            AttemptOutcome::Healed(mapping) => self.apply(&schema, &mapping, &value, false, start),
            AttemptOutcome::Failed { reason } => {
                debug!(route, attempt = %attempt.id, reason = %reason, "Serving unhealed body");
                Ok(HealOutcome::passthrough(start))
            }
        }
    }

    fn apply(
        &self,
        schema: &ExpectedSchema,
        mapping: &FieldMapping,
        value: &Value,
        from_cache: bool,
        start: Instant,
    ) -> Result<HealOutcome> {
        let healed = transform::apply(schema, mapping, value);
        let body = Bytes::from(serde_json::to_vec(&healed)?);
        Ok(HealOutcome {
            body: Some(body),
            metadata: HealingMetadata {
                healed: true,
                from_cache,
                mapping_version: mapping.version,
                confidence: Some(mapping.confidence),
                fingerprint: Some(mapping.fingerprint),
                duration_us: elapsed_us(start),
            },
        })
    }

    /// Drive one attempt to a terminal state. Runs on its own task.
    async fn run_attempt(
        self,
        lease: AttemptLease,
        schema: Arc<ExpectedSchema>,
        report: DriftReport,
        sample: Arc<Value>,
        route: String,
    ) {
        let started = Instant::now();
        let attempt = Arc::clone(lease.attempt());
        let fingerprint = attempt.fingerprint;
        let fabric = &self.inner.fabric;

        fabric.emit(
            Thought::new(ThoughtType::Alert, format!("Schema validation failed for {route}")).with_details(json!({
                "endpoint": route,
                "expected_model": schema.id.as_ref(),
                "error_count": report.missing.len() + report.mistyped.len(),
                "fingerprint": fingerprint,
                "attempt_id": attempt.id,
            })),
        );

        let candidate = match self.inner.inference.infer(&schema, &report).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(attempt = %attempt.id, error = %e, "Inference failed");
                fabric.emit(Thought::new(ThoughtType::Failure, format!("Healing error: {e}")));
                lease.finish(AttemptOutcome::Failed { reason: e.to_string() });
                return;
            }
        };

        let confidence = self.inner.aggregation.aggregate(candidate.confidences());

        match self.inner.gate.evaluate(&attempt.id, fingerprint, confidence) {
            GateDecision::AutoApply => {}
            GateDecision::Await(pending) => {
                attempt.set_status(AttemptStatus::AwaitingApproval);
                let proposed: Vec<String> = candidate.correspondences.iter().map(ToString::to_string).collect();
                fabric.emit(
                    Thought::new(
                        ThoughtType::Waiting,
                        format!(
                            "Low confidence ({:.0}%). Waiting for human approval...",
                            confidence * 100.0
                        ),
                    )
                    .with_confidence(confidence)
                    .requiring_approval()
                    .with_details(json!({
                        "attempt_id": attempt.id,
                        "fingerprint": fingerprint,
                        "mappings": proposed,
                    })),
                );

                match self.inner.gate.wait(pending).await {
                    ApprovalOutcome::Approved => {}
                    ApprovalOutcome::Rejected => {
                        fabric.emit(Thought::new(ThoughtType::Failure, "Healing rejected by user"));
                        lease.finish(AttemptOutcome::Failed {
                            reason: "rejected".to_string(),
                        });
                        return;
                    }
                    ApprovalOutcome::TimedOut => {
                        let err = SutureError::ApprovalTimeout(self.inner.gate.timeout().as_secs());
                        fabric.emit(Thought::new(
                            ThoughtType::Failure,
                            format!("{err}; serving unhealed response"),
                        ));
                        lease.finish(AttemptOutcome::Failed { reason: err.to_string() });
                        return;
                    }
                }
            }
            GateDecision::SlotBusy(held) => {
                fabric.emit(Thought::new(
                    ThoughtType::Failure,
                    format!(
                        "Attempt {} is already awaiting approval; serving unhealed response",
                        held.attempt_id
                    ),
                ));
                lease.finish(AttemptOutcome::Failed {
                    reason: "approval slot busy".to_string(),
                });
                return;
            }
        }

        attempt.set_status(AttemptStatus::Applying);
        fabric.emit(Thought::new(
            ThoughtType::Patching,
            format!(
                "Hot-patching schema mapping with {} field(s)...",
                candidate.correspondences.len()
            ),
        ));

        let mapping = FieldMapping::new(fingerprint, &schema.id, candidate.correspondences, confidence);
        let stored = self.inner.cache.store(fingerprint, mapping);
        fabric.record_healing();

        let healed = transform::apply(&schema, &stored, &sample);
        let still_missing = transform::unsatisfied_fields(&schema, &healed);
        let verdict = if still_missing.is_empty() {
            "Validating healed data against expected schema... all fields satisfied".to_string()
        } else {
            format!(
                "Validating healed data against expected schema... still absent: {}",
                still_missing.join(", ")
            )
        };
        fabric.emit(Thought::new(ThoughtType::Retrying, verdict).with_details(json!({ "still_missing": still_missing })));

        fabric.emit(
            Thought::new(ThoughtType::Success, "Schema healed successfully! Cached for future requests.")
                .with_confidence(confidence)
                .with_cost(candidate.cost_usd)
                .with_details(json!({
                    "mappings_count": stored.len(),
                    "mapping_version": stored.version,
                    "unresolved": candidate.unresolved,
                    "duration_ms": started.elapsed().as_secs_f64() * 1000.0,
                    "cached": true,
                })),
        );

        info!(
            attempt = %attempt.id,
            fingerprint = %fingerprint,
            version = stored.version,
            confidence,
            "Healing attempt succeeded"
        );
        lease.finish(AttemptOutcome::Healed(stored));
    }

    // ------------------------------------------------------------------------
    // Control operations
    // ------------------------------------------------------------------------

    pub fn session_stats(&self) -> SessionStats {
        self.inner.fabric.stats(self.inner.gate.has_pending())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            session: self.session_stats(),
            pending: self.inner.gate.pending(),
            human_in_loop: self.inner.gate.policy(),
            aggregation: self.inner.aggregation,
            backend: self.inner.inference.backend_name(),
            inference_calls: self.inner.inference.calls(),
            cache: self.inner.cache.stats(),
            in_flight: self.inner.attempts.snapshot(),
        }
    }

    /// Toggle human-in-loop mode. Attempts already pending stay pending.
    pub fn set_human_in_loop(&self, enabled: bool, threshold: f32) -> ApprovalPolicy {
        let policy = self.inner.gate.set_policy(enabled, threshold);
        let message = if enabled {
            format!(
                "Human-in-the-loop enabled: mappings below {:.0}% confidence need approval",
                policy.threshold * 100.0
            )
        } else {
            "Human-in-the-loop disabled: mappings auto-apply".to_string()
        };
        self.inner.fabric.emit(Thought::new(ThoughtType::Info, message));
        policy
    }

    /// Approve or reject the pending attempt.
    pub fn submit_decision(&self, approved: bool) -> Result<PendingInfo> {
        let info = self.inner.gate.submit(approved)?;
        let status = if approved { "approved" } else { "rejected" };
        self.inner.fabric.emit(
            Thought::new(ThoughtType::Info, format!("User {status} the healing action"))
                .with_details(json!({ "attempt_id": info.attempt_id })),
        );
        Ok(info)
    }

    /// Drop every cached mapping.
    pub fn reset_mappings(&self) -> usize {
        let cleared = self.inner.cache.reset();
        self.inner.fabric.emit(Thought::new(
            ThoughtType::Info,
            format!("Mapping cache reset ({cleared} mapping(s) cleared)"),
        ));
        cleared
    }

    /// Evict one cached mapping.
    pub fn invalidate_mapping(&self, fingerprint: SchemaFingerprint) -> bool {
        let removed = self.inner.cache.invalidate(fingerprint);
        if removed {
            self.inner.fabric.emit(Thought::new(
                ThoughtType::Info,
                format!("Mapping {fingerprint} invalidated"),
            ));
        }
        removed
    }
}

#[inline]
fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{HeuristicBackend, StaticBackend};
    use crate::mapping::Correspondence;

    fn engine_with(backend: Arc<dyn MappingBackend>, config: EngineConfig) -> HealingEngine {
        HealingEngine::new(config, Arc::new(SchemaRegistry::with_defaults()), backend)
    }

    fn parse(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_conforming_body_passes_through() {
        let engine = engine_with(Arc::new(HeuristicBackend::new()), EngineConfig::default());
        let body = br#"{"user_id": 1, "name": "a"}"#;
        let outcome = engine.heal("/api/users/1", body).await.unwrap();
        assert!(outcome.body.is_none());
        assert!(!outcome.metadata.healed);
        assert_eq!(engine.session_stats().total_thoughts, 0);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_route_not_parsed() {
        let engine = engine_with(Arc::new(HeuristicBackend::new()), EngineConfig::default());
        let outcome = engine.heal("/health", b"not json").await.unwrap();
        assert!(outcome.body.is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_is_error() {
        let engine = engine_with(Arc::new(HeuristicBackend::new()), EngineConfig::default());
        let err = engine.heal("/api/users/1", b"{oops").await.unwrap_err();
        assert_eq!(err.status_code(), 422);
    }

    #[tokio::test]
    async fn test_heuristic_heals_and_caches() {
        let engine = engine_with(Arc::new(HeuristicBackend::new()), EngineConfig::default());
        let body = br#"{"uid": 7, "full_name": "Ada", "email_address": "a@x.io"}"#;

        let first = engine.heal("/api/users/7", body).await.unwrap();
        assert!(first.metadata.healed);
        assert!(!first.metadata.from_cache);
        assert_eq!(first.metadata.mapping_version, 1);
        let healed = parse(first.body.as_ref().unwrap());
        assert_eq!(healed["user_id"], 7);
        assert_eq!(healed["name"], "Ada");

        let second = engine.heal("/api/users/7", body).await.unwrap();
        assert!(second.metadata.from_cache);
        assert_eq!(second.body, first.body);
        assert_eq!(engine.session_stats().session_healings, 1);
    }

    #[tokio::test]
    async fn test_inference_failure_serves_unhealed() {
        let engine = engine_with(Arc::new(StaticBackend::failing("boom")), EngineConfig::default());
        let outcome = engine.heal("/api/users/1", br#"{"uid": 1}"#).await.unwrap();
        assert!(outcome.body.is_none());
        assert!(engine.cache().is_empty());
        let last = engine.fabric().history(1);
        assert_eq!(last[0].kind, ThoughtType::Failure);
    }

    #[tokio::test]
    async fn test_busy_slot_fails_second_fingerprint() {
        let backend = StaticBackend::new(vec![
            Correspondence::new("uid", "user_id", 0.6),
            Correspondence::new("pid", "product_id", 0.6),
        ]);
        let config = EngineConfig {
            human_in_loop: true,
            approval_threshold: 0.9,
            approval_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let engine = engine_with(Arc::new(backend), config);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.heal("/api/users/1", br#"{"uid": 1, "name": "a"}"#).await })
        };
        while !engine.gate().has_pending() {
            tokio::task::yield_now().await;
        }

        let second = engine
            .heal("/api/products/1", br#"{"pid": 1, "title": "t", "price": 2}"#)
            .await
            .unwrap();
        assert!(second.body.is_none());

        engine.submit_decision(true).unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(first.metadata.healed);
        assert_eq!(engine.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_without_pending() {
        let engine = engine_with(Arc::new(HeuristicBackend::new()), EngineConfig::default());
        assert!(matches!(engine.submit_decision(true), Err(SutureError::ApprovalWithoutPending)));
        assert_eq!(engine.session_stats().total_thoughts, 0);
    }

    #[test]
    fn test_toggle_emits_info() {
        let engine = engine_with(Arc::new(HeuristicBackend::new()), EngineConfig::default());
        let policy = engine.set_human_in_loop(true, 0.8);
        assert!(policy.enabled);
        let last = engine.fabric().history(1);
        assert_eq!(last[0].kind, ThoughtType::Info);
        assert!(last[0].message.contains("80%"));
    }
}
