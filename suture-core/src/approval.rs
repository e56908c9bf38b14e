//! Approval gate: auto-apply or suspend a hypothesis pending a human decision.
//!
//! There is a single pending slot. Claiming it is exclusive; a second
//! attempt arriving while it is held is told the slot is busy. Attempts for
//! the same fingerprint never reach the gate twice because they are
//! coalesced upstream of it.

use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{Result, SutureError};
use crate::schema::SchemaFingerprint;

/// Human-in-loop mode and its confidence threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ApprovalPolicy {
    pub enabled: bool,
    pub threshold: f32,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.7,
        }
    }
}

/// Identity of the attempt holding the pending slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingInfo {
    pub attempt_id: String,
    pub fingerprint: SchemaFingerprint,
    pub confidence: f32,
}

struct PendingSlot {
    info: PendingInfo,
    decision: oneshot::Sender<bool>,
}

/// Ticket held by the attempt that claimed the slot.
pub struct PendingApproval {
    attempt_id: String,
    decision: oneshot::Receiver<bool>,
}

impl PendingApproval {
    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }
}

/// Result of evaluating one hypothesis.
pub enum GateDecision {
    AutoApply,
    Await(PendingApproval),
    /// Another attempt already holds the slot
    SlotBusy(PendingInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
}

pub struct ApprovalGate {
    policy: RwLock<ApprovalPolicy>,
    slot: Mutex<Option<PendingSlot>>,
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy, timeout: Duration) -> Self {
        Self {
            policy: RwLock::new(policy),
            slot: Mutex::new(None),
            timeout,
        }
    }

    pub fn policy(&self) -> ApprovalPolicy {
        *self.policy.read()
    }

    /// Change mode and threshold. Attempts already pending keep waiting.
    pub fn set_policy(&self, enabled: bool, threshold: f32) -> ApprovalPolicy {
        let policy = ApprovalPolicy {
            enabled,
            threshold: threshold.clamp(0.0, 1.0),
        };
        *self.policy.write() = policy;
        info!(enabled, threshold = policy.threshold, "Approval policy updated");
        policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Decide whether `confidence` auto-applies or must wait for a human.
    pub fn evaluate(
        &self,
        attempt_id: &str,
        fingerprint: SchemaFingerprint,
        confidence: f32,
    ) -> GateDecision {
        let policy = self.policy();
        if !policy.enabled || confidence >= policy.threshold {
            return GateDecision::AutoApply;
        }

        let mut slot = self.slot.lock();
        if let Some(held) = slot.as_ref() {
            return GateDecision::SlotBusy(held.info.clone());
        }

        let (tx, rx) = oneshot::channel();
        *slot = Some(PendingSlot {
            info: PendingInfo {
                attempt_id: attempt_id.to_string(),
                fingerprint,
                confidence,
            },
            decision: tx,
        });
        info!(attempt = attempt_id, fingerprint = %fingerprint, confidence, "Awaiting approval");

        GateDecision::Await(PendingApproval {
            attempt_id: attempt_id.to_string(),
            decision: rx,
        })
    }

    /// Block until a decision arrives or the window closes.
    ///
    /// A timeout fails closed.
    pub async fn wait(&self, mut pending: PendingApproval) -> ApprovalOutcome {
        match tokio::time::timeout(self.timeout, &mut pending.decision).await {
            Ok(Ok(true)) => ApprovalOutcome::Approved,
            Ok(Ok(false)) | Ok(Err(_)) => ApprovalOutcome::Rejected,
            Err(_) => {
                let mut slot = self.slot.lock();
                let ours = slot
                    .as_ref()
                    .is_some_and(|s| s.info.attempt_id == pending.attempt_id);
                if ours {
                    *slot = None;
                    drop(slot);
                    warn!(attempt = %pending.attempt_id, timeout_s = self.timeout.as_secs(), "Approval timed out");
                    return ApprovalOutcome::TimedOut;
                }
                drop(slot);
                // a decision raced the deadline and already left the slot
                match pending.decision.try_recv() {
                    Ok(true) => ApprovalOutcome::Approved,
                    _ => ApprovalOutcome::Rejected,
                }
            }
        }
    }

    /// Resolve the pending attempt.
    pub fn submit(&self, approved: bool) -> Result<PendingInfo> {
        let held = self
            .slot
            .lock()
            .take()
            .ok_or(SutureError::ApprovalWithoutPending)?;
        // the waiter may have gone away; the slot is released either way
        let _ = held.decision.send(approved);
        info!(attempt = %held.info.attempt_id, approved, "Approval decision submitted");
        Ok(held.info)
    }

    pub fn pending(&self) -> Option<PendingInfo> {
        self.slot.lock().as_ref().map(|s| s.info.clone())
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(ApprovalPolicy::default(), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn gate(enabled: bool, threshold: f32, timeout_ms: u64) -> ApprovalGate {
        ApprovalGate::new(
            ApprovalPolicy { enabled, threshold },
            Duration::from_millis(timeout_ms),
        )
    }

    #[test]
    fn test_threshold_gating() {
        let g = gate(true, 0.7, 1000);
        assert!(matches!(g.evaluate("a1", SchemaFingerprint(1), 0.75), GateDecision::AutoApply));
        assert!(matches!(g.evaluate("a2", SchemaFingerprint(2), 0.65), GateDecision::Await(_)));
        assert!(g.has_pending());
    }

    #[test]
    fn test_disabled_always_auto_applies() {
        let g = gate(false, 0.9, 1000);
        assert!(matches!(g.evaluate("a1", SchemaFingerprint(1), 0.1), GateDecision::AutoApply));
        assert!(!g.has_pending());
    }

    #[test]
    fn test_second_attempt_sees_busy_slot() {
        let g = gate(true, 0.9, 1000);
        let _first = g.evaluate("a1", SchemaFingerprint(1), 0.5);
        match g.evaluate("a2", SchemaFingerprint(2), 0.5) {
            GateDecision::SlotBusy(held) => assert_eq!(held.attempt_id, "a1"),
            _ => panic!("slot must not be overwritten"),
        }
        assert_eq!(g.pending().unwrap().attempt_id, "a1");
    }

    #[test]
    fn test_submit_without_pending_is_error() {
        let g = gate(true, 0.9, 1000);
        assert!(matches!(g.submit(true), Err(SutureError::ApprovalWithoutPending)));
    }

    #[tokio::test]
    async fn test_submit_resolves_waiter() {
        let g = Arc::new(gate(true, 0.9, 5_000));
        let GateDecision::Await(pending) = g.evaluate("a1", SchemaFingerprint(1), 0.85) else {
            panic!("expected await");
        };
        let waiter = {
            let g = Arc::clone(&g);
            tokio::spawn(async move { g.wait(pending).await })
        };
        let info = g.submit(false).unwrap();
        assert_eq!(info.attempt_id, "a1");
        assert_eq!(waiter.await.unwrap(), ApprovalOutcome::Rejected);
        assert!(!g.has_pending());
    }

    #[tokio::test]
    async fn test_timeout_fails_closed_and_frees_slot() {
        let g = gate(true, 0.9, 20);
        let GateDecision::Await(pending) = g.evaluate("a1", SchemaFingerprint(1), 0.5) else {
            panic!("expected await");
        };
        assert_eq!(g.wait(pending).await, ApprovalOutcome::TimedOut);
        assert!(!g.has_pending());
        assert!(g.submit(true).is_err());
    }

    #[test]
    fn test_toggle_off_keeps_pending() {
        let g = gate(true, 0.9, 1000);
        let _pending = g.evaluate("a1", SchemaFingerprint(1), 0.5);
        g.set_policy(false, 0.9);
        assert!(g.has_pending());
        assert!(g.submit(true).is_ok());
    }
}
