//! Healing attempts and per-fingerprint coalescing.
//!
//! At most one attempt runs per fingerprint. The first request to miss the
//! cache becomes the leader and receives an [`AttemptLease`]; later requests
//! for the same fingerprint join as waiters on the same attempt. All of them
//! are released together when the lease finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::mapping::FieldMapping;
use crate::schema::SchemaFingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Inferring,
    AwaitingApproval,
    Applying,
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Succeeded | AttemptStatus::Failed)
    }
}

/// Terminal result shared with every waiter.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Healed(Arc<FieldMapping>),
    Failed { reason: String },
}

#[derive(Debug, Clone)]
struct AttemptState {
    status: AttemptStatus,
    outcome: Option<AttemptOutcome>,
}

/// One in-flight drift resolution.
#[derive(Debug)]
pub struct HealingAttempt {
    pub id: String,
    pub fingerprint: SchemaFingerprint,
    pub schema_id: String,
    /// Route of the request that started the attempt
    pub route: String,
    waiters: AtomicU64,
    state: watch::Sender<AttemptState>,
}

impl HealingAttempt {
    pub fn status(&self) -> AttemptStatus {
        self.state.borrow().status
    }

    pub fn set_status(&self, status: AttemptStatus) {
        self.state.send_modify(|s| {
            if !s.status.is_terminal() {
                s.status = status;
            }
        });
        debug!(attempt = %self.id, status = ?status, "Attempt status changed");
    }

    /// Requests currently waiting on this attempt, leader included.
    pub fn waiters(&self) -> u64 {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> AttemptOutcome {
        self.waiters.fetch_add(1, Ordering::Relaxed);
        let mut rx = self.state.subscribe();
        let outcome = match rx.wait_for(|s| s.outcome.is_some()).await {
            Ok(state) => state.outcome.clone(),
            Err(_) => None,
        };
        self.waiters.fetch_sub(1, Ordering::Relaxed);
        outcome.unwrap_or_else(|| AttemptOutcome::Failed {
            reason: "attempt dropped".to_string(),
        })
    }

    fn publish(&self, outcome: AttemptOutcome) {
        let status = match outcome {
            AttemptOutcome::Healed(_) => AttemptStatus::Succeeded,
            AttemptOutcome::Failed { .. } => AttemptStatus::Failed,
        };
        self.state.send_modify(|s| {
            s.status = status;
            s.outcome = Some(outcome);
        });
    }
}

/// Serializable view of an in-flight attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptSnapshot {
    pub id: String,
    pub fingerprint: SchemaFingerprint,
    pub schema_id: String,
    pub route: String,
    pub status: AttemptStatus,
    pub waiters: u64,
}

/// How a request joined an attempt.
pub enum Joined {
    /// This request started the attempt and must drive it
    Leader(AttemptLease),
    Follower(Arc<HealingAttempt>),
}

/// In-flight attempts keyed by fingerprint.
#[derive(Default)]
pub struct AttemptRegistry {
    in_flight: Mutex<HashMap<SchemaFingerprint, Arc<HealingAttempt>>>,
    next_id: AtomicU64,
}

impl AttemptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the attempt for `fingerprint`, starting one if none is running.
    pub fn join(self: &Arc<Self>, fingerprint: SchemaFingerprint, schema_id: &str, route: &str) -> Joined {
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(&fingerprint) {
            debug!(attempt = %existing.id, fingerprint = %fingerprint, "Joining in-flight attempt");
            return Joined::Follower(Arc::clone(existing));
        }

        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (state, _) = watch::channel(AttemptState {
            status: AttemptStatus::Inferring,
            outcome: None,
        });
        let attempt = Arc::new(HealingAttempt {
            id: format!("attempt_{n}"),
            fingerprint,
            schema_id: schema_id.to_string(),
            route: route.to_string(),
            waiters: AtomicU64::new(0),
            state,
        });
        in_flight.insert(fingerprint, Arc::clone(&attempt));

        Joined::Leader(AttemptLease {
            registry: Arc::clone(self),
            attempt,
            finished: false,
        })
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<AttemptSnapshot> {
        let mut all: Vec<_> = self
            .in_flight
            .lock()
            .values()
            .map(|a| AttemptSnapshot {
                id: a.id.clone(),
                fingerprint: a.fingerprint,
                schema_id: a.schema_id.clone(),
                route: a.route.clone(),
                status: a.status(),
                waiters: a.waiters(),
            })
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn remove(&self, attempt: &HealingAttempt) {
        let mut in_flight = self.in_flight.lock();
        let same = in_flight
            .get(&attempt.fingerprint)
            .is_some_and(|a| a.id == attempt.id);
        if same {
            in_flight.remove(&attempt.fingerprint);
        }
    }
}

/// Leader's handle on an attempt.
///
/// Finishing removes the in-flight entry and then releases every waiter.
/// Dropping an unfinished lease fails the attempt so waiters never hang.
pub struct AttemptLease {
    registry: Arc<AttemptRegistry>,
    attempt: Arc<HealingAttempt>,
    finished: bool,
}

impl AttemptLease {
    pub fn attempt(&self) -> &Arc<HealingAttempt> {
        &self.attempt
    }

    pub fn finish(mut self, outcome: AttemptOutcome) {
        self.finished = true;
        self.registry.remove(&self.attempt);
        self.attempt.publish(outcome);
    }
}

impl Drop for AttemptLease {
    fn drop(&mut self) {
        if !self.finished {
            warn!(attempt = %self.attempt.id, "Attempt lease dropped before completion");
            self.registry.remove(&self.attempt);
            self.attempt.publish(AttemptOutcome::Failed {
                reason: "attempt aborted".to_string(),
            });
        }
    }
}
