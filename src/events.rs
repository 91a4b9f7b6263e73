//! Emitted event shapes and the subscription bus.
//!
//! Components publish into a bounded broadcast channel. Producers never
//! block: a subscriber that falls behind sees `Lagged` on its receiver and
//! misses events rather than stalling the pipeline.

use crate::alerting::Alert;
use crate::circuit_breaker::CircuitState;
use crate::error::Severity;
use crate::resource_monitor::ResourceKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A telemetry event entering the reliability path. Only the category and
/// action participate in rate-limit keying; the payload stays opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: Uuid,
    pub category: String,
    pub action: String,
    pub timestamp: SystemTime,
    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    pub fn new(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            action: action.into(),
            timestamp: SystemTime::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Key used for per-event rate limiting.
    pub fn rate_key(&self) -> String {
        format!("{}:{}", self.category, self.action)
    }
}

/// Everything the reliability layer announces to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReliabilityEvent {
    /// A queue crossed its high watermark. `level` is fill ratio in [0, 1].
    Pressure { queue: String, level: f64 },
    /// A queue under pressure fell back to its low watermark.
    Relief { queue: String },
    /// A resource sample crossed a warning or critical threshold.
    ResourceAlert {
        resource: ResourceKind,
        severity: Severity,
        value: f64,
        threshold: f64,
        at: SystemTime,
    },
    /// A circuit breaker changed state.
    CircuitStateChange {
        key: String,
        from: CircuitState,
        to: CircuitState,
        at: SystemTime,
    },
    /// An alert rule matched and was dispatched.
    AlertFired { rule: String, alert: Alert },
}

/// Broadcast bus with a bounded per-subscriber buffer.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ReliabilityEvent>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    /// `capacity` bounds each subscriber's buffer; lagging subscribers drop
    /// events, they never hold up publishers.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, published: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReliabilityEvent> {
        self.sender.subscribe()
    }

    /// Publish, dropping the event when nobody is listening.
    pub fn publish(&self, event: ReliabilityEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
