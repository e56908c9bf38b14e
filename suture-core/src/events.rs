//! Event and stats fabric.
//!
//! Every reasoning step is a [`Thought`] fanned out to all subscribers and
//! appended to a bounded replay buffer. Each subscriber owns a bounded
//! queue; a full or closed queue drops that subscriber without blocking the
//! publisher or other subscribers. Counters are cumulative and never
//! affected by buffer eviction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

// ============================================================================
// Thoughts
// ============================================================================

/// Kind of reasoning step, used by the dashboard for styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThoughtType {
    Alert,
    Analyzing,
    Scanning,
    Hypothesis,
    Patching,
    Retrying,
    Success,
    Failure,
    Waiting,
    Info,
}

/// One immutable record of the reasoning trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thought {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ThoughtType,
    pub message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Thought {
    /// Draft a thought; id and timestamp are assigned on emit.
    pub fn new(kind: ThoughtType, message: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind,
            message: message.into(),
            timestamp: String::new(),
            confidence: None,
            cost_usd: None,
            requires_approval: false,
            details: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Aggregate session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub subscriber_count: usize,
    pub total_thoughts: u64,
    pub total_cost_usd: f64,
    pub session_healings: u64,
    pub pending_approval: bool,
}

// ============================================================================
// Fabric
// ============================================================================

/// Sizing for the fabric.
#[derive(Debug, Clone, Copy)]
pub struct FabricConfig {
    /// Replay buffer capacity
    pub trace_capacity: usize,
    /// Per-subscriber queue depth
    pub subscriber_queue: usize,
    /// Buffered thoughts handed to a new subscriber
    pub replay_on_connect: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            trace_capacity: 50,
            subscriber_queue: 64,
            replay_on_connect: 10,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<Thought>>,
}

#[derive(Default)]
struct FabricInner {
    trace: VecDeque<Arc<Thought>>,
    subscribers: Vec<Subscriber>,
}

const NANOS_PER_USD: f64 = 1_000_000_000.0;

/// Broadcast fabric shared by the engine and the control plane.
pub struct EventFabric {
    config: FabricConfig,
    // trace and subscribers share one lock so every subscriber sees the
    // same order as the buffer
    inner: Mutex<FabricInner>,
    next_thought: AtomicU64,
    next_subscriber: AtomicU64,
    cost_nano_usd: AtomicU64,
    session_healings: AtomicU64,
}

impl EventFabric {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            config: FabricConfig {
                trace_capacity: config.trace_capacity.max(1),
                subscriber_queue: config.subscriber_queue.max(1),
                replay_on_connect: config.replay_on_connect,
            },
            inner: Mutex::new(FabricInner::default()),
            next_thought: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(0),
            cost_nano_usd: AtomicU64::new(0),
            session_healings: AtomicU64::new(0),
        }
    }

    /// Publish a thought to the buffer and every live subscriber.
    pub fn emit(&self, mut thought: Thought) -> Arc<Thought> {
        let mut inner = self.inner.lock();

        let n = self.next_thought.fetch_add(1, Ordering::Relaxed) + 1;
        thought.id = format!("thought_{n}");
        thought.timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let thought = Arc::new(thought);

        if inner.trace.len() >= self.config.trace_capacity.max(1) {
            inner.trace.pop_front();
        }
        inner.trace.push_back(Arc::clone(&thought));

        let before = inner.subscribers.len();
        inner
            .subscribers
            .retain(|s| s.tx.try_send(Arc::clone(&thought)).is_ok());
        let dropped = before - inner.subscribers.len();
        drop(inner);

        if dropped > 0 {
            info!(dropped, "Dropped slow or disconnected stream subscribers");
        }
        debug!(id = %thought.id, kind = ?thought.kind, message = %thought.message, "Thought emitted");
        thought
    }

    /// Register a new subscriber.
    ///
    /// The returned subscription carries the replay snapshot; thoughts
    /// emitted after this call arrive on its queue.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        let skip = inner.trace.len().saturating_sub(self.config.replay_on_connect);
        let replay = inner.trace.iter().skip(skip).cloned().collect();
        inner.subscribers.push(Subscriber { id, tx });
        let count = inner.subscribers.len();
        drop(inner);

        info!(subscriber = id, count, "Stream subscriber added");
        Subscription {
            id,
            rx,
            replay,
            fabric: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.id != id);
        let count = inner.subscribers.len();
        drop(inner);
        info!(subscriber = id, count, "Stream subscriber removed");
    }

    /// Add one inference call's cost to the session total.
    pub fn charge(&self, cost_usd: f64) {
        if cost_usd > 0.0 && cost_usd.is_finite() {
            let nanos = (cost_usd * NANOS_PER_USD).round() as u64;
            self.cost_nano_usd.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    pub fn record_healing(&self) {
        self.session_healings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.cost_nano_usd.load(Ordering::Relaxed) as f64 / NANOS_PER_USD
    }

    pub fn total_thoughts(&self) -> u64 {
        self.next_thought.load(Ordering::Relaxed)
    }

    pub fn session_healings(&self) -> u64 {
        self.session_healings.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn stats(&self, pending_approval: bool) -> SessionStats {
        SessionStats {
            subscriber_count: self.subscriber_count(),
            total_thoughts: self.total_thoughts(),
            total_cost_usd: self.total_cost_usd(),
            session_healings: self.session_healings(),
            pending_approval,
        }
    }

    /// Most recent `limit` buffered thoughts, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Arc<Thought>> {
        let inner = self.inner.lock();
        let skip = inner.trace.len().saturating_sub(limit);
        inner.trace.iter().skip(skip).cloned().collect()
    }

    /// Clear the replay buffer. Counters are untouched.
    pub fn clear(&self) -> usize {
        let cleared = {
            let mut inner = self.inner.lock();
            let n = inner.trace.len();
            inner.trace.clear();
            n
        };
        self.emit(Thought::new(ThoughtType::Info, "Agent stream cleared"));
        cleared
    }
}

impl Default for EventFabric {
    fn default() -> Self {
        Self::new(FabricConfig::default())
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<Thought>>,
    replay: Vec<Arc<Thought>>,
    fabric: Weak<EventFabric>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffered thoughts captured at subscribe time.
    pub fn take_replay(&mut self) -> Vec<Arc<Thought>> {
        std::mem::take(&mut self.replay)
    }

    /// Next live thought; `None` once the fabric has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<Thought>> {
        self.rx.recv().await
    }

    pub(crate) fn receiver_mut(&mut self) -> &mut mpsc::Receiver<Arc<Thought>> {
        &mut self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fabric(trace: usize, queue: usize) -> Arc<EventFabric> {
        Arc::new(EventFabric::new(FabricConfig {
            trace_capacity: trace,
            subscriber_queue: queue,
            replay_on_connect: 10,
        }))
    }

    #[test]
    fn test_ids_and_bounded_buffer() {
        let f = fabric(3, 8);
        for i in 0..5 {
            f.emit(Thought::new(ThoughtType::Info, format!("t{i}")));
        }
        let history = f.history(50);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, "thought_3");
        assert_eq!(history[2].message, "t4");
        // eviction never decrements counters
        assert_eq!(f.total_thoughts(), 5);
        assert_eq!(f.history(1)[0].id, "thought_5");
    }

    #[tokio::test]
    async fn test_broadcast_to_all_subscribers() {
        let f = fabric(10, 8);
        let mut a = f.subscribe();
        let mut b = f.subscribe();
        assert_eq!(f.subscriber_count(), 2);

        f.emit(Thought::new(ThoughtType::Alert, "drift"));
        assert_eq!(a.recv().await.unwrap().kind, ThoughtType::Alert);
        assert_eq!(b.recv().await.unwrap().message, "drift");

        drop(a);
        assert_eq!(f.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_without_blocking() {
        let f = fabric(10, 1);
        let mut slow = f.subscribe();
        f.emit(Thought::new(ThoughtType::Info, "one"));
        f.emit(Thought::new(ThoughtType::Info, "two"));
        assert_eq!(f.subscriber_count(), 0);

        assert_eq!(slow.recv().await.unwrap().message, "one");
        assert!(slow.recv().await.is_none());
    }

    #[test]
    fn test_replay_on_subscribe() {
        let f = fabric(50, 8);
        for i in 0..15 {
            f.emit(Thought::new(ThoughtType::Info, format!("t{i}")));
        }
        let mut sub = f.subscribe();
        let replay = sub.take_replay();
        assert_eq!(replay.len(), 10);
        assert_eq!(replay[0].message, "t5");
    }

    #[test]
    fn test_charge_and_clear() {
        let f = fabric(10, 8);
        f.charge(0.000123);
        f.charge(0.000877);
        f.charge(0.0);
        assert!((f.total_cost_usd() - 0.001).abs() < 1e-12);

        f.emit(Thought::new(ThoughtType::Info, "x"));
        f.record_healing();
        assert_eq!(f.clear(), 1);
        let history = f.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "Agent stream cleared");
        assert_eq!(f.total_thoughts(), 2);
        assert_eq!(f.session_healings(), 1);
        assert!((f.total_cost_usd() - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_thought_serialization() {
        let f = fabric(10, 8);
        let t = f.emit(
            Thought::new(ThoughtType::Waiting, "approve?")
                .with_confidence(0.5)
                .requiring_approval(),
        );
        let json = serde_json::to_value(&*t).unwrap();
        assert_eq!(json["type"], "waiting");
        assert_eq!(json["requires_approval"], true);
        assert!(json.get("cost_usd").is_none());
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
