//! Gateway HTTP contract tests
//!
//! Handlers are exercised directly: signature enforcement, boundary
//! validation, and the mapping from backend events to escalation
//! starts/stops.

use super::*;
use crate::audio_cache::TemplateCache;
use crate::backend::BackendClient;
use crate::config::CallerIds;
use crate::events::OutboundQueue;
use crate::orchestrator::llm::LlmClient;
use crate::providers::{CapabilityRouter, ProviderRegistry, UsageMetrics};
use crate::session::SessionStore;
use dastak_core::{EscalationId, Language};
use dastak_telephony_sdk::TelephonyConfig;
use std::time::Duration;

fn test_state() -> Arc<GatewayState> {
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
    let telephony = Arc::new(
        TelephonyClient::new(TelephonyConfig {
            api_base: "http://127.0.0.1:9".into(),
            account_id: "AC".into(),
            api_key: "k".into(),
            auth_token: "t".into(),
            callback_base: "http://127.0.0.1:9".into(),
            hmac_secret: "stream-secret".into(),
        })
        .unwrap(),
    );
    let router = Arc::new(CapabilityRouter::new(
        Arc::new(ProviderRegistry::new(vec![], vec![], vec![])),
        Arc::new(UsageMetrics::default()),
    ));
    let orchestrator = crate::orchestrator::Orchestrator::new(
        Arc::new(SessionStore::new(100, Duration::from_secs(1800))),
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
    let escalations = EscalationEngine::new(
        backend,
        telephony.clone(),
        orchestrator.clone(),
        bus.clone(),
        CallerIds::new("+911140001111"),
    );
    Arc::new(GatewayState {
        orchestrator,
        escalations,
        telephony,
        bus,
        signer: WebhookSigner::new(b"webhook-secret".to_vec()),
        stream_token: "stream-token".into(),
        auth_failures: AtomicU64::new(0),
    })
}

fn signed_headers(state: &GatewayState, body: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        SIGNATURE_HEADER,
        state.signer.sign(body).parse().unwrap(),
    );
    headers
}

#[tokio::test]
async fn unsigned_webhook_is_rejected_and_counted() {
    let state = test_state();
    let body = Bytes::from_static(b"callId=C-1&digit=1");

    let result = keypad(State(state.clone()), HeaderMap::new(), body).await;
    let err = result.err().expect("must reject");
    assert_eq!(err.0.status_code(), 401);
    assert_eq!(state.auth_failure_count(), 1);
}

#[tokio::test]
async fn tampered_body_fails_verification() {
    let state = test_state();
    let signed_for = b"callId=C-1&digit=1";
    let headers = signed_headers(&state, signed_for);

    let result = keypad(
        State(state.clone()),
        headers,
        Bytes::from_static(b"callId=C-1&digit=2"),
    )
    .await;
    assert_eq!(result.err().unwrap().0.status_code(), 401);
}

#[tokio::test]
async fn empty_keypad_digit_is_unprocessable() {
    let state = test_state();
    let body = Bytes::from_static(b"callId=C-1&digit=");
    let headers = signed_headers(&state, &body);

    let result = keypad(State(state), headers, body).await;
    assert_eq!(result.err().unwrap().0.status_code(), 422);
}

#[tokio::test]
async fn keypad_for_unknown_call_is_accepted_and_dropped() {
    let state = test_state();
    let body = Bytes::from_static(b"callId=C-ghost&digit=1&seq=1");
    let headers = signed_headers(&state, &body);

    let status = keypad(State(state), headers, body).await.unwrap();
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn unknown_call_status_string_is_bad_request() {
    let state = test_state();
    let body = Bytes::from_static(b"callId=C-1&status=teleported");
    let headers = signed_headers(&state, &body);

    let result = call_status(State(state), headers, body).await;
    assert_eq!(result.err().unwrap().0.status_code(), 400);
}

#[tokio::test]
async fn malformed_event_body_is_bad_request() {
    let state = test_state();
    let body = Bytes::from_static(b"not json");
    let headers = signed_headers(&state, &body);

    let result = order_event(
        State(state),
        Path("new".to_string()),
        headers,
        body,
    )
    .await;
    assert_eq!(result.err().unwrap().0.status_code(), 400);
}

#[tokio::test(start_paused = true)]
async fn order_new_starts_ladder_and_accepted_stops_it() {
    let state = test_state();

    let body = Bytes::from_static(br#"{"orderId":"O-1","storeId":"V-42","amount":325.00}"#);
    let headers = signed_headers(&state, &body);
    let status = order_event(
        State(state.clone()),
        Path("new".to_string()),
        headers,
        body,
    )
    .await
    .unwrap();
    assert_eq!(status, StatusCode::ACCEPTED);

    let id = EscalationId::for_order(Purpose::VendorNewOrder, &OrderId::new("O-1"));
    let escalation = state.escalations.get(&id).expect("ladder started");
    assert!(escalation.is_active());

    let body = Bytes::from_static(br#"{"orderId":"O-1"}"#);
    let headers = signed_headers(&state, &body);
    order_event(
        State(state.clone()),
        Path("accepted".to_string()),
        headers,
        body,
    )
    .await
    .unwrap();
    assert!(!escalation.is_active());
}

/// The address-update fast path: rider confirms over chat, so the
/// voice steps of the ladder must never run.
#[tokio::test(start_paused = true)]
async fn rider_accepted_stops_address_update_ladder() {
    let state = test_state();

    let body = Bytes::from_static(br#"{"orderId":"O-3","address":"12 MG Road"}"#);
    let headers = signed_headers(&state, &body);
    address_changed(State(state.clone()), headers, body)
        .await
        .unwrap();

    let id = EscalationId::for_order(Purpose::RiderAddressUpdate, &OrderId::new("O-3"));
    let escalation = state.escalations.get(&id).expect("ladder started");
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(escalation.fired(), 1, "chat step fires at once");

    let body = Bytes::from_static(br#"{"orderId":"O-3"}"#);
    let headers = signed_headers(&state, &body);
    rider_event(
        State(state.clone()),
        Path("accepted".to_string()),
        headers,
        body,
    )
    .await
    .unwrap();

    tokio::time::advance(Duration::from_secs(300)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(escalation.fired(), 1, "ring and voice steps never fire");
}

#[tokio::test(start_paused = true)]
async fn concurrent_escalation_starts_share_one_run() {
    let state = test_state();

    let body = Bytes::from_static(br#"{"orderId":"O-4"}"#);
    let headers_a = signed_headers(&state, &body);
    let headers_b = headers_a.clone();

    let (a, b) = tokio::join!(
        order_event(State(state.clone()), Path("new".into()), headers_a, body.clone()),
        order_event(State(state.clone()), Path("new".into()), headers_b, body.clone()),
    );
    a.unwrap();
    b.unwrap();

    let id = EscalationId::for_order(Purpose::VendorNewOrder, &OrderId::new("O-4"));
    assert!(state.escalations.get(&id).is_some());
    let runs = state
        .escalations
        .list()
        .into_iter()
        .filter(|v| v.order_id.as_str() == "O-4")
        .count();
    assert_eq!(runs, 1, "idempotent start: one ladder run");
}
