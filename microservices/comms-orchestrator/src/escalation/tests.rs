//! Escalation engine tests
//!
//! Timer-driven properties run on a paused clock: the test advances
//! virtual time explicitly and yields so the runner task observes it.

use super::*;
use crate::audio_cache::TemplateCache;
use crate::backend::BackendClient;
use crate::config::CallerIds;
use crate::events::{EventBus, OutboundQueue, TopicFamily};
use crate::orchestrator::{llm::LlmClient, Orchestrator};
use crate::providers::{CapabilityRouter, ProviderRegistry, UsageMetrics};
use crate::session::SessionStore;
use dastak_core::Language;
use dastak_telephony_sdk::TelephonyConfig;
use std::sync::Arc;

fn dead_telephony() -> Arc<TelephonyClient> {
    Arc::new(
        TelephonyClient::new(TelephonyConfig {
            api_base: "http://127.0.0.1:9".into(),
            account_id: "AC".into(),
            api_key: "k".into(),
            auth_token: "t".into(),
            callback_base: "http://127.0.0.1:9".into(),
            hmac_secret: "s".into(),
        })
        .unwrap(),
    )
}

fn engine() -> (Arc<EscalationEngine>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    let queue = OutboundQueue::new(None, bus.clone());
    let backend = Arc::new(
        BackendClient::new(
            "http://127.0.0.1:9".into(),
            "t".into(),
            Language::Hindi,
            queue,
        )
        .unwrap(),
    );
    let router = Arc::new(CapabilityRouter::new(
        Arc::new(ProviderRegistry::new(vec![], vec![], vec![])),
        Arc::new(UsageMetrics::default()),
    ));
    let telephony = dead_telephony();
    let orchestrator = Orchestrator::new(
        Arc::new(SessionStore::new(100, std::time::Duration::from_secs(1800))),
        router,
        Arc::new(TemplateCache::new(1024)),
        backend.clone(),
        telephony.clone(),
        bus.clone(),
        Arc::new(LlmClient::new("http://127.0.0.1:9".into(), String::new()).unwrap()),
        CallerIds::new("+911140001111"),
        dastak_core::PhoneNumber::normalize("+911244567890"),
        Language::Hindi,
        "standard-female".into(),
    );
    let engine = EscalationEngine::new(
        backend,
        telephony,
        orchestrator,
        bus.clone(),
        CallerIds::new("+911140001111"),
    );
    (engine, bus)
}

/// Let spawned tasks run without advancing virtual time.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Two starts for the same (purpose, order) share one ladder run.
#[tokio::test(start_paused = true)]
async fn start_is_idempotent_per_purpose_and_order() {
    let (engine, _bus) = engine();

    let first = engine
        .start(Purpose::CustomerStatus, OrderId::new("O-4"), serde_json::json!({}))
        .unwrap();
    let second = engine
        .start(Purpose::CustomerStatus, OrderId::new("O-4"), serde_json::json!({}))
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(engine.list().len(), 1, "only one ladder run exists");

    tokio::time::advance(std::time::Duration::from_secs(31)).await;
    settle().await;

    // Both steps of the single run fired; nothing doubled.
    assert_eq!(first.fired(), 2);
    assert_eq!(first.status(), EscalationStatus::Completed);
}

/// A stop issued before a step's due time means that step never fires.
#[tokio::test(start_paused = true)]
async fn stop_before_due_time_prevents_later_steps() {
    let (engine, _bus) = engine();

    let escalation = engine
        .start(Purpose::CustomerStatus, OrderId::new("O-5"), serde_json::json!({}))
        .unwrap();
    settle().await;
    assert_eq!(escalation.fired(), 1, "step 0 fires immediately");

    engine.stop(&escalation.id, "order accepted").unwrap();
    assert_eq!(escalation.status(), EscalationStatus::Stopped);

    tokio::time::advance(std::time::Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(escalation.fired(), 1, "chat step must never fire after stop");
}

/// Stop is idempotent and unknown ids are NotFound.
#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let (engine, _bus) = engine();
    let escalation = engine
        .start(Purpose::CustomerDelay, OrderId::new("O-6"), serde_json::json!({}))
        .unwrap();
    settle().await;

    engine.stop(&escalation.id, "first").unwrap();
    engine.stop(&escalation.id, "second").unwrap();

    assert!(engine
        .stop(&EscalationId::for_order(Purpose::CustomerDelay, &OrderId::new("O-none")), "x")
        .is_err());
}

/// Steps whose due time already passed fire immediately, in order.
#[tokio::test(start_paused = true)]
async fn past_due_steps_fire_immediately_in_order() {
    let (engine, bus) = engine();
    let mut rx = bus.subscribe(TopicFamily::Comms);

    let escalation = engine
        .start(Purpose::CustomerStatus, OrderId::new("O-7"), serde_json::json!({}))
        .unwrap();
    tokio::time::advance(std::time::Duration::from_secs(600)).await;
    settle().await;

    assert_eq!(escalation.fired(), 2);
    let first = rx.try_recv().unwrap();
    let second = rx.try_recv().unwrap();
    assert_eq!(first.topic, "comms.notification.sent");
    assert_eq!(first.payload["step"], 0);
    assert_eq!(first.payload["channel"], "push");
    assert_eq!(second.payload["step"], 1);
    assert_eq!(second.payload["channel"], "chat");
}

/// A ladder that runs out without acknowledgement reports exhaustion.
#[tokio::test(start_paused = true)]
async fn exhaustion_emits_medium_severity_event() {
    let (engine, bus) = engine();
    let mut rx = bus.subscribe(TopicFamily::Escalation);

    let escalation = engine
        .start(Purpose::CustomerDelay, OrderId::new("O-8"), serde_json::json!({}))
        .unwrap();
    settle().await;

    assert_eq!(escalation.status(), EscalationStatus::Completed);

    let mut saw_exhausted = false;
    while let Ok(event) = rx.try_recv() {
        if event.topic == "escalation.exhausted" {
            assert_eq!(event.severity, crate::events::Severity::Medium);
            assert_eq!(event.payload["orderId"], "O-8");
            saw_exhausted = true;
        }
    }
    assert!(saw_exhausted);
}

/// An acknowledgement on the bus stands the ladder down before its
/// voice steps fire (the chat-confirmed fast path).
#[tokio::test(start_paused = true)]
async fn ack_event_stops_ladder_before_ring_step() {
    let (engine, bus) = engine();

    let escalation = engine
        .start(
            Purpose::RiderAddressUpdate,
            OrderId::new("O-3"),
            serde_json::json!({}),
        )
        .unwrap();
    settle().await;
    assert_eq!(escalation.fired(), 1, "chat step fires at T+0");

    // Core Backend relays the rider's chat confirmation.
    bus.publish(crate::events::BusEvent::new(
        "escalation.ack",
        serde_json::json!({
            "purpose": "rider.address_update",
            "orderId": "O-3",
        }),
    ));
    settle().await;
    assert_eq!(escalation.status(), EscalationStatus::Stopped);

    tokio::time::advance(std::time::Duration::from_secs(300)).await;
    settle().await;
    assert_eq!(escalation.fired(), 1, "ring and voice steps never fire");
}

/// After a restart-equivalent settle, a new start for the same order is
/// allowed once the previous run settled.
#[tokio::test(start_paused = true)]
async fn settled_escalation_can_be_restarted() {
    let (engine, _bus) = engine();
    let first = engine
        .start(Purpose::CustomerDelay, OrderId::new("O-9"), serde_json::json!({}))
        .unwrap();
    settle().await;
    assert_eq!(first.status(), EscalationStatus::Completed);

    let second = engine
        .start(Purpose::CustomerDelay, OrderId::new("O-9"), serde_json::json!({}))
        .unwrap();
    assert!(second.is_active() || second.status() == EscalationStatus::Completed);
    settle().await;
    assert_eq!(second.fired(), 1);
    assert!(!Arc::ptr_eq(&first, &second));
}
