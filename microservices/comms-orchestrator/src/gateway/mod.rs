//! Telephony gateway (C7)
//!
//! The inbound surface the Telephony Provider and Core Backend call:
//! lifecycle webhooks, keypad events, recording completions, backend
//! order/rider events, and the bidirectional audio stream. Every body
//! is HMAC-verified against the raw bytes before parsing; failures are
//! counted and rejected 401 without retry.

pub mod stream;

#[cfg(test)]
mod tests;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use dastak_core::{CallId, CommsError, OrderId, PhoneNumber, Purpose};
use dastak_telephony_sdk::signature::SIGNATURE_HEADER;
use dastak_telephony_sdk::{CallStatus, TelephonyClient, WebhookSigner};

use crate::escalation::EscalationEngine;
use crate::events::{BusEvent, EventBus};
use crate::orchestrator::{CallEvent, Orchestrator};

/// Recording downloads are bounded to 10 MB
pub const MAX_RECORDING_BYTES: usize = 10 * 1024 * 1024;

pub struct GatewayState {
    pub orchestrator: Arc<Orchestrator>,
    pub escalations: Arc<EscalationEngine>,
    pub telephony: Arc<TelephonyClient>,
    pub bus: Arc<EventBus>,
    pub signer: WebhookSigner,
    /// Expected token on stream upgrade URLs
    pub stream_token: String,
    pub auth_failures: AtomicU64,
}

impl GatewayState {
    /// Raw-body HMAC check. Failures count toward the auth-failure
    /// metric even though the request is rejected.
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if signature.is_empty() || !self.signer.verify(body, signature) {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
            return Err(CommsError::Auth("webhook signature invalid".into()).into());
        }
        Ok(())
    }

    pub fn auth_failure_count(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }
}

/// Error envelope for every public handler
#[derive(Debug)]
pub struct ApiError(pub CommsError);

impl From<CommsError> for ApiError {
    fn from(err: CommsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "code": self.0.error_code(),
            })),
        )
            .into_response()
    }
}

pub fn routes(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/telephony/call-status", post(call_status))
        .route("/telephony/keypad", post(keypad))
        .route("/telephony/recording", post(recording_complete))
        .route("/telephony/stream", any(stream::stream_ws))
        .route("/events/order/{kind}", post(order_event))
        .route("/events/rider/{kind}", post(rider_event))
        .route("/events/address/changed", post(address_changed))
        .with_state(state)
}

fn parse_form<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_urlencoded::from_bytes(body)
        .map_err(|e| CommsError::Validation(format!("malformed form body: {e}")).into())
}

#[derive(Debug, Deserialize)]
struct CallStatusForm {
    #[serde(rename = "callId")]
    call_id: String,
    status: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default, rename = "duration")]
    _duration: Option<u64>,
    #[serde(default, rename = "recordingUrl")]
    recording_url: Option<String>,
}

/// Lifecycle webhook. Unknown call ids with a `from` number are adopted
/// as inbound sessions; anything else unknown is dropped.
async fn call_status(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.verify(&headers, &body)?;
    let form: CallStatusForm = parse_form(&body)?;
    let status = CallStatus::parse(&form.status)
        .ok_or_else(|| CommsError::Validation(format!("unknown status {}", form.status)))?;
    let call_id = CallId::new(form.call_id);

    if state.orchestrator.store().get(&call_id).is_none() {
        if let Some(from) = &form.from {
            if !status.is_terminal() {
                let phone = PhoneNumber::normalize(from);
                info!(call_id = %call_id, from = %phone, "Adopting inbound call");
                state
                    .orchestrator
                    .attach_inbound(call_id.clone(), phone)
                    .await?;
            }
        }
    }

    if let Some(url) = form.recording_url {
        spawn_recording_fetch(state.clone(), call_id.clone(), url);
    }

    state
        .orchestrator
        .deliver(&call_id, CallEvent::Status(status))
        .await;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct KeypadForm {
    #[serde(rename = "callId")]
    call_id: String,
    digit: String,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default, rename = "context")]
    _context: Option<String>,
}

async fn keypad(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.verify(&headers, &body)?;
    let form: KeypadForm = parse_form(&body)?;
    let digit = form
        .digit
        .trim()
        .chars()
        .next()
        .ok_or_else(|| CommsError::MissingInput("keypad digit is empty".into()))?;

    state
        .orchestrator
        .deliver(
            &CallId::new(form.call_id),
            CallEvent::Keypad {
                digit,
                seq: form.seq,
            },
        )
        .await;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct RecordingForm {
    #[serde(rename = "callId")]
    call_id: String,
    #[serde(rename = "recordingUrl")]
    recording_url: String,
}

async fn recording_complete(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.verify(&headers, &body)?;
    let form: RecordingForm = parse_form(&body)?;
    spawn_recording_fetch(state.clone(), CallId::new(form.call_id), form.recording_url);
    Ok(StatusCode::ACCEPTED)
}

/// Recording bytes are fetched off the webhook path, bounded in size
/// and time, and handed to the session as an event.
fn spawn_recording_fetch(state: Arc<GatewayState>, call_id: CallId, url: String) {
    tokio::spawn(async move {
        let audio = match state
            .telephony
            .fetch_recording(&url, MAX_RECORDING_BYTES)
            .await
        {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Recording fetch failed");
                None
            }
        };
        state
            .orchestrator
            .deliver(&call_id, CallEvent::RecordingReady { url, audio })
            .await;
    });
}

#[derive(Debug, Deserialize)]
struct OrderEventBody {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(flatten)]
    rest: serde_json::Value,
}

/// Order events from the Core Backend drive the escalation ladders.
async fn order_event(
    State(state): State<Arc<GatewayState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.verify(&headers, &body)?;
    let event: OrderEventBody = serde_json::from_slice(&body)
        .map_err(|e| CommsError::Validation(format!("malformed event body: {e}")))?;
    let order_id = OrderId::new(event.order_id);

    match kind.as_str() {
        "new" => {
            state
                .escalations
                .start(Purpose::VendorNewOrder, order_id.clone(), event.rest.clone())?;
        }
        "accepted" | "rejected" => {
            state
                .escalations
                .stop_for_order(Purpose::VendorNewOrder, &order_id, &format!("order {kind}"));
        }
        "ready" => {
            state
                .escalations
                .stop_for_order(Purpose::VendorReminder, &order_id, "order ready");
        }
        "delivered" => {
            state
                .escalations
                .stop_for_order(Purpose::CustomerStatus, &order_id, "order delivered");
            state
                .escalations
                .stop_for_order(Purpose::CustomerDelay, &order_id, "order delivered");
        }
        other => {
            return Err(CommsError::Validation(format!("unknown order event {other}")).into());
        }
    }

    state.bus.publish(
        BusEvent::new(format!("order.{kind}"), event.rest)
            .correlated(order_id.as_str().to_string()),
    );
    Ok(StatusCode::ACCEPTED)
}

async fn rider_event(
    State(state): State<Arc<GatewayState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.verify(&headers, &body)?;
    let event: OrderEventBody = serde_json::from_slice(&body)
        .map_err(|e| CommsError::Validation(format!("malformed event body: {e}")))?;
    let order_id = OrderId::new(event.order_id);

    match kind.as_str() {
        "assigned" => {
            state
                .escalations
                .start(Purpose::RiderAssign, order_id.clone(), event.rest.clone())?;
        }
        "accepted" => {
            state
                .escalations
                .stop_for_order(Purpose::RiderAssign, &order_id, "rider accepted");
            state
                .escalations
                .stop_for_order(Purpose::RiderAddressUpdate, &order_id, "rider accepted");
        }
        "rejected" => {
            state
                .escalations
                .stop_for_order(Purpose::RiderAssign, &order_id, "rider rejected");
        }
        other => {
            return Err(CommsError::Validation(format!("unknown rider event {other}")).into());
        }
    }

    state.bus.publish(
        BusEvent::new(format!("order.rider.{kind}"), event.rest)
            .correlated(order_id.as_str().to_string()),
    );
    Ok(StatusCode::ACCEPTED)
}

async fn address_changed(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.verify(&headers, &body)?;
    let event: OrderEventBody = serde_json::from_slice(&body)
        .map_err(|e| CommsError::Validation(format!("malformed event body: {e}")))?;
    let order_id = OrderId::new(event.order_id);
    state
        .escalations
        .start(Purpose::RiderAddressUpdate, order_id.clone(), event.rest.clone())?;
    state.bus.publish(
        BusEvent::new("order.address.changed", event.rest)
            .correlated(order_id.as_str().to_string()),
    );
    Ok(StatusCode::ACCEPTED)
}

/// Purposes parse from their public names on this surface.
pub fn parse_purpose(raw: &str) -> Result<Purpose, ApiError> {
    Purpose::from_str(raw).map_err(ApiError::from)
}
