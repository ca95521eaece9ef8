//! Internal control surface
//!
//! Escalation start/stop, provider health and priority, session
//! inspection, and counters. Auth is a service-to-service bearer
//! credential, distinct from the webhook HMAC.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use dastak_core::{CallId, CommsError, EscalationId, OrderId};

use crate::audio_cache::TemplateCache;
use crate::escalation::EscalationEngine;
use crate::events::OutboundQueue;
use crate::gateway::{ApiError, GatewayState};
use crate::providers::{ProviderKind, ProviderRegistry, UsageMetrics};
use crate::session::SessionStore;

pub struct AdminState {
    pub escalations: Arc<EscalationEngine>,
    pub registry: Arc<ProviderRegistry>,
    pub usage: Arc<UsageMetrics>,
    pub store: Arc<SessionStore>,
    pub clips: Arc<TemplateCache>,
    pub queue: OutboundQueue,
    pub gateway: Arc<GatewayState>,
    pub token: String,
}

impl AdminState {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if !bearer_matches(headers, &self.token) {
            return Err(CommsError::Auth("admin credential invalid".into()).into());
        }
        Ok(())
    }
}

fn bearer_matches(headers: &HeaderMap, token: &str) -> bool {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    !presented.is_empty() && presented == token
}

pub fn routes(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/escalation/start", post(escalation_start))
        .route("/escalation/stop", post(escalation_stop))
        .route("/providers/health", get(providers_health))
        .route("/providers/priority", put(providers_priority))
        .route("/sessions", get(sessions))
        .route("/sessions/{call_id}", get(session_detail))
        .route("/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    purpose: String,
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(default)]
    data: serde_json::Value,
}

async fn escalation_start(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(&headers)?;
    let purpose = crate::gateway::parse_purpose(&req.purpose)?;
    let escalation = state
        .escalations
        .start(purpose, OrderId::new(req.order_id), req.data)?;
    Ok(Json(serde_json::json!({
        "escalationId": escalation.id.to_string(),
        "status": escalation.status(),
        "stepsTotal": escalation.steps.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    #[serde(rename = "escalationId")]
    escalation_id: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn escalation_stop(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Json(req): Json<StopRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(&headers)?;
    let reason = req.reason.as_deref().unwrap_or("administrative");
    state
        .escalations
        .stop(&EscalationId(req.escalation_id.clone()), reason)?;
    Ok(Json(serde_json::json!({ "stopped": req.escalation_id })))
}

async fn providers_health(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(&headers)?;
    Ok(Json(serde_json::json!({
        "priorities": {
            "asr": state.registry.priority(ProviderKind::Asr),
            "tts": state.registry.priority(ProviderKind::Tts),
        },
        "health": state.registry.health_snapshot(),
    })))
}

#[derive(Debug, Deserialize)]
struct PriorityRequest {
    kind: ProviderKind,
    priority: Vec<String>,
}

async fn providers_priority(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Json(req): Json<PriorityRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(&headers)?;
    state.registry.set_priority(req.kind, req.priority.clone())?;
    Ok(Json(serde_json::json!({
        "kind": req.kind,
        "priority": req.priority,
    })))
}

async fn sessions(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(&headers)?;
    Ok(Json(serde_json::json!({
        "count": state.store.len(),
        "sessions": state.store.list(),
    })))
}

async fn session_detail(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(&headers)?;
    let session = state
        .store
        .get(&CallId::new(call_id.clone()))
        .ok_or_else(|| CommsError::NotFound(format!("session {call_id}")))?;
    Ok(Json(serde_json::to_value(session.info()).unwrap_or_default()))
}

async fn stats(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authorize(&headers)?;
    Ok(Json(serde_json::json!({
        "providers": state.usage.snapshot(),
        "audioCache": state.clips.stats(),
        "outboundQueue": state.queue.stats(),
        "sessions": state.store.len(),
        "escalations": {
            "active": state.escalations.active_count(),
            "known": state.escalations.list().len(),
        },
        "authFailures": state.gateway.auth_failure_count(),
        "busEvents": state.gateway.bus.published_count(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        if !value.is_empty() {
            h.insert("authorization", value.parse().unwrap());
        }
        h
    }

    #[test]
    fn bearer_prefix_is_required() {
        assert!(bearer_matches(&headers("Bearer s3cret"), "s3cret"));
        assert!(!bearer_matches(&headers("s3cret"), "s3cret"));
        assert!(!bearer_matches(&headers("Bearer wrong"), "s3cret"));
        assert!(!bearer_matches(&headers(""), "s3cret"));
        assert!(!bearer_matches(&headers("Bearer "), "s3cret"));
    }
}
