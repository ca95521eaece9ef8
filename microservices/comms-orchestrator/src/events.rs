//! Event bus and durable outbound queue
//!
//! Two layers with different guarantees:
//! - In-process pub/sub over bounded broadcast channels per topic family.
//!   Delivery is best-effort; a subscriber that lags past the channel
//!   capacity loses the oldest events rather than blocking publishers.
//! - An outbound queue for events that must reach external consumers.
//!   A single drainer delivers at-least-once with backoff, so events for
//!   the same order keep their submission order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

const BUS_CAPACITY: usize = 256;
const QUEUE_CAPACITY: usize = 10_000;
const DELIVERY_ATTEMPTS: u32 = 10;
const DELIVERY_BACKOFF_MS: u64 = 500;
const DELIVERY_BACKOFF_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One event on the in-process bus
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: String,
    pub severity: Severity,
    pub correlation_id: String,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            severity: Severity::Low,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            payload,
            at: Utc::now(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn correlated(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

/// Topic families subscribers attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicFamily {
    Order,
    Call,
    Escalation,
    Comms,
}

impl TopicFamily {
    fn of(topic: &str) -> Self {
        match topic.split('.').next() {
            Some("order") => Self::Order,
            Some("call") => Self::Call,
            Some("escalation") => Self::Escalation,
            _ => Self::Comms,
        }
    }
}

pub struct EventBus {
    order: broadcast::Sender<BusEvent>,
    call: broadcast::Sender<BusEvent>,
    escalation: broadcast::Sender<BusEvent>,
    comms: broadcast::Sender<BusEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            order: broadcast::channel(BUS_CAPACITY).0,
            call: broadcast::channel(BUS_CAPACITY).0,
            escalation: broadcast::channel(BUS_CAPACITY).0,
            comms: broadcast::channel(BUS_CAPACITY).0,
            published: AtomicU64::new(0),
        }
    }

    fn sender(&self, family: TopicFamily) -> &broadcast::Sender<BusEvent> {
        match family {
            TopicFamily::Order => &self.order,
            TopicFamily::Call => &self.call,
            TopicFamily::Escalation => &self.escalation,
            TopicFamily::Comms => &self.comms,
        }
    }

    /// Publish to the topic's family. Never blocks; no subscribers is fine.
    pub fn publish(&self, event: BusEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %event.topic, severity = ?event.severity, "Bus event");
        let _ = self.sender(TopicFamily::of(&event.topic)).send(event);
    }

    pub fn subscribe(&self, family: TopicFamily) -> broadcast::Receiver<BusEvent> {
        self.sender(family).subscribe()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event queued for external consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Ordering key; events with the same key are delivered in order
    pub key: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
    pub pending: u64,
}

/// Durable outbound queue with a single serial drainer.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<QueuedEvent>,
    counters: Arc<QueueCounters>,
}

impl OutboundQueue {
    pub fn new(endpoint: Option<String>, bus: Arc<EventBus>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let counters = Arc::new(QueueCounters::default());
        tokio::spawn(Self::drain(endpoint, rx, counters.clone(), bus));
        Self { tx, counters }
    }

    /// Enqueue an event. Fails only when the queue itself is full, which
    /// callers treat as resource exhaustion.
    pub fn enqueue(
        &self,
        key: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), dastak_core::CommsError> {
        let event = QueuedEvent {
            key: key.into(),
            kind: kind.into(),
            payload,
            enqueued_at: Utc::now(),
        };
        self.tx.try_send(event).map_err(|_| {
            dastak_core::CommsError::Unavailable("outbound queue full".to_string())
        })?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let enqueued = self.counters.enqueued.load(Ordering::Relaxed);
        let delivered = self.counters.delivered.load(Ordering::Relaxed);
        let dropped = self.counters.dropped.load(Ordering::Relaxed);
        QueueStats {
            enqueued,
            delivered,
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped,
            pending: enqueued.saturating_sub(delivered + dropped),
        }
    }

    async fn drain(
        endpoint: Option<String>,
        mut rx: mpsc::Receiver<QueuedEvent>,
        counters: Arc<QueueCounters>,
        bus: Arc<EventBus>,
    ) {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("queue HTTP client");

        while let Some(event) = rx.recv().await {
            let mut attempt = 0u32;
            loop {
                match Self::deliver(&http, endpoint.as_deref(), &event).await {
                    Ok(()) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => {
                        attempt += 1;
                        counters.retried.fetch_add(1, Ordering::Relaxed);
                        if attempt >= DELIVERY_ATTEMPTS {
                            error!(
                                key = %event.key,
                                kind = %event.kind,
                                attempts = attempt,
                                error = %e,
                                "Outbound event shed after repeated delivery failures"
                            );
                            counters.dropped.fetch_add(1, Ordering::Relaxed);
                            bus.publish(
                                BusEvent::new(
                                    "comms.notification.failed",
                                    serde_json::json!({
                                        "key": event.key,
                                        "kind": event.kind,
                                        "reason": "outbound queue delivery exhausted",
                                    }),
                                )
                                .severity(Severity::High),
                            );
                            break;
                        }
                        let backoff = (DELIVERY_BACKOFF_MS << attempt.min(6))
                            .min(DELIVERY_BACKOFF_CAP_MS);
                        warn!(
                            key = %event.key,
                            attempt,
                            backoff_ms = backoff,
                            error = %e,
                            "Outbound delivery failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
    }

    async fn deliver(
        http: &reqwest::Client,
        endpoint: Option<&str>,
        event: &QueuedEvent,
    ) -> Result<(), String> {
        let Some(endpoint) = endpoint else {
            // No external queue configured: consume locally.
            debug!(key = %event.key, kind = %event.kind, "Outbound event (no queue endpoint)");
            return Ok(());
        };
        let resp = http
            .post(endpoint)
            .json(event)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("queue endpoint returned {}", resp.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_family_routes_by_prefix() {
        assert_eq!(TopicFamily::of("order.new"), TopicFamily::Order);
        assert_eq!(TopicFamily::of("call.result"), TopicFamily::Call);
        assert_eq!(TopicFamily::of("escalation.ack"), TopicFamily::Escalation);
        assert_eq!(TopicFamily::of("comms.notification.sent"), TopicFamily::Comms);
        assert_eq!(TopicFamily::of("unknown"), TopicFamily::Comms);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(TopicFamily::Escalation);
        bus.publish(BusEvent::new("escalation.ack", serde_json::json!({"id": "e-1"})));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, "escalation.ack");
    }

    #[tokio::test]
    async fn bus_drops_for_lagging_subscriber_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(TopicFamily::Comms);
        for i in 0..(BUS_CAPACITY + 50) {
            bus.publish(BusEvent::new("comms.test", serde_json::json!({ "i": i })));
        }
        // The slow subscriber lost the oldest events but the bus never blocked.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 50),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_preserves_submission_order_per_key() {
        let bus = Arc::new(EventBus::new());
        let queue = OutboundQueue::new(None, bus);
        for i in 0..5 {
            queue
                .enqueue("O-1", "order.transition", serde_json::json!({ "seq": i }))
                .unwrap();
        }
        // Single serial drainer: pending eventually hits zero, nothing dropped.
        for _ in 0..50 {
            if queue.stats().pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = queue.stats();
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.dropped, 0);
    }
}
