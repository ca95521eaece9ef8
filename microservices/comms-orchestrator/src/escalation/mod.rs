//! Escalation ladder engine (C8)
//!
//! Runs the time-based ladder for any notification purpose. One runner
//! task per escalation executes steps serially, so step N never runs
//! before step N-1 finished dispatching. Starts are idempotent per
//! (purpose, order); stops cancel all pending timers and are observed
//! by a concurrently firing timer before it dispatches.

pub mod flows;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dastak_core::{
    CommsError, EscalationId, Order, OrderId, Party, PartyKind, Purpose, Result,
};
use dastak_telephony_sdk::{PlaceCallRequest, TelephonyClient};

use crate::backend::BackendClient;
use crate::config::CallerIds;
use crate::events::{BusEvent, EventBus, Severity, TopicFamily};
use crate::orchestrator::Orchestrator;

use flows::{ladder, EscalationChannel, EscalationStep};

/// Duration a ring-only call is allowed to ring
const RING_CALL_SECS: u32 = 30;
/// How long finished escalations stay visible on the admin surface
const RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Active,
    Stopped,
    Completed,
    Failed,
}

pub struct Escalation {
    pub id: EscalationId,
    pub purpose: Purpose,
    pub order_id: OrderId,
    pub target: PartyKind,
    pub steps: &'static [EscalationStep],
    pub data: serde_json::Value,
    pub started_at: DateTime<Utc>,
    started: Instant,
    index: AtomicUsize,
    fired: AtomicUsize,
    status: Mutex<EscalationStatus>,
    cancel: CancellationToken,
}

impl Escalation {
    fn new(purpose: Purpose, order_id: OrderId, data: serde_json::Value) -> Option<Arc<Self>> {
        let steps = ladder(purpose)?;
        Some(Arc::new(Self {
            id: EscalationId::for_order(purpose, &order_id),
            purpose,
            order_id,
            target: purpose.target(),
            steps,
            data,
            started_at: Utc::now(),
            started: Instant::now(),
            index: AtomicUsize::new(0),
            fired: AtomicUsize::new(0),
            status: Mutex::new(EscalationStatus::Active),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn status(&self) -> EscalationStatus {
        *self.status.lock()
    }

    pub fn is_active(&self) -> bool {
        self.status() == EscalationStatus::Active
    }

    /// Steps dispatched so far
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::Acquire)
    }

    /// Transition out of `Active`; returns false if already settled.
    fn settle(&self, to: EscalationStatus) -> bool {
        let mut status = self.status.lock();
        if *status == EscalationStatus::Active {
            *status = to;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> EscalationView {
        EscalationView {
            id: self.id.clone(),
            purpose: self.purpose,
            order_id: self.order_id.clone(),
            target: self.target,
            status: self.status(),
            step_index: self.index.load(Ordering::Acquire),
            steps_fired: self.fired(),
            steps_total: self.steps.len(),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationView {
    pub id: EscalationId,
    pub purpose: Purpose,
    pub order_id: OrderId,
    pub target: PartyKind,
    pub status: EscalationStatus,
    pub step_index: usize,
    pub steps_fired: usize,
    pub steps_total: usize,
    pub started_at: DateTime<Utc>,
}

pub struct EscalationEngine {
    escalations: DashMap<EscalationId, Arc<Escalation>>,
    backend: Arc<BackendClient>,
    telephony: Arc<TelephonyClient>,
    orchestrator: Arc<Orchestrator>,
    bus: Arc<EventBus>,
    caller_ids: CallerIds,
}

impl EscalationEngine {
    pub fn new(
        backend: Arc<BackendClient>,
        telephony: Arc<TelephonyClient>,
        orchestrator: Arc<Orchestrator>,
        bus: Arc<EventBus>,
        caller_ids: CallerIds,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            escalations: DashMap::new(),
            backend,
            telephony,
            orchestrator,
            bus,
            caller_ids,
        });
        engine.spawn_ack_listener();
        engine
    }

    /// Acknowledgements arrive over the bus: from the orchestrator on a
    /// successful terminal state, and from Core Backend events relayed
    /// by the gateway.
    fn spawn_ack_listener(self: &Arc<Self>) {
        let engine = self.clone();
        let mut rx = self.bus.subscribe(TopicFamily::Escalation);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.topic == "escalation.ack" => {
                        let purpose = event.payload["purpose"]
                            .as_str()
                            .and_then(|p| p.parse::<Purpose>().ok());
                        let order_id = event.payload["orderId"].as_str().map(OrderId::new);
                        if let (Some(purpose), Some(order_id)) = (purpose, order_id) {
                            engine.stop_for_order(purpose, &order_id, "acknowledged");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Ack listener lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Start an escalation. Idempotent: a second start for the same
    /// (purpose, order) returns the existing active escalation.
    pub fn start(
        self: &Arc<Self>,
        purpose: Purpose,
        order_id: OrderId,
        data: serde_json::Value,
    ) -> Result<Arc<Escalation>> {
        if ladder(purpose).is_none() {
            return Err(CommsError::Validation(format!(
                "{purpose} has no escalation flow"
            )));
        }
        let id = EscalationId::for_order(purpose, &order_id);
        let escalation = match self.escalations.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_active() {
                    return Ok(occupied.get().clone());
                }
                let fresh = Escalation::new(purpose, order_id, data)
                    .expect("ladder checked above");
                occupied.insert(fresh.clone());
                fresh
            }
            Entry::Vacant(vacant) => {
                let fresh = Escalation::new(purpose, order_id, data)
                    .expect("ladder checked above");
                vacant.insert(fresh.clone());
                fresh
            }
        };

        info!(
            escalation_id = %escalation.id,
            purpose = %purpose,
            steps = escalation.steps.len(),
            "Escalation started"
        );
        self.bus.publish(
            BusEvent::new(
                "escalation.started",
                serde_json::json!({
                    "escalationId": escalation.id.to_string(),
                    "purpose": purpose.as_str(),
                    "orderId": escalation.order_id.as_str(),
                }),
            )
            .correlated(escalation.order_id.as_str().to_string()),
        );

        let engine = self.clone();
        let handle = escalation.clone();
        tokio::spawn(async move {
            engine.run(handle).await;
        });
        Ok(escalation)
    }

    /// Cancel all pending timers. Idempotent; unknown ids error so the
    /// admin surface can 404.
    pub fn stop(&self, id: &EscalationId, reason: &str) -> Result<()> {
        let Some(escalation) = self.escalations.get(id).map(|e| e.value().clone()) else {
            return Err(CommsError::NotFound(format!("escalation {id}")));
        };
        if escalation.settle(EscalationStatus::Stopped) {
            escalation.cancel.cancel();
            info!(escalation_id = %id, reason, "Escalation stopped");
            self.bus.publish(
                BusEvent::new(
                    "escalation.stopped",
                    serde_json::json!({
                        "escalationId": id.to_string(),
                        "reason": reason,
                    }),
                )
                .correlated(escalation.order_id.as_str().to_string()),
            );
        }
        Ok(())
    }

    /// Stop by (purpose, order) if such an escalation exists.
    pub fn stop_for_order(&self, purpose: Purpose, order_id: &OrderId, reason: &str) {
        let id = EscalationId::for_order(purpose, order_id);
        let _ = self.stop(&id, reason);
    }

    pub fn get(&self, id: &EscalationId) -> Option<Arc<Escalation>> {
        self.escalations.get(id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<EscalationView> {
        self.escalations.iter().map(|e| e.value().snapshot()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.escalations
            .iter()
            .filter(|e| e.value().is_active())
            .count()
    }

    /// Ladder runner: one task per escalation, steps strictly serial.
    async fn run(self: Arc<Self>, escalation: Arc<Escalation>) {
        for (index, step) in escalation.steps.iter().enumerate() {
            let due = escalation.started + step.after;
            tokio::select! {
                _ = escalation.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(due) => {}
            }
            // A stop racing the timer settles status first; observe it.
            if !escalation.is_active() {
                break;
            }
            escalation.index.store(index, Ordering::Release);
            let outcome = self.dispatch(&escalation, step).await;
            escalation.fired.fetch_add(1, Ordering::AcqRel);
            escalation.index.store(index + 1, Ordering::Release);

            let (topic, severity) = match &outcome {
                Ok(()) => ("comms.notification.sent", Severity::Low),
                Err(_) => ("comms.notification.failed", Severity::Medium),
            };
            self.bus.publish(
                BusEvent::new(
                    topic,
                    serde_json::json!({
                        "escalationId": escalation.id.to_string(),
                        "step": index,
                        "channel": step.channel.as_str(),
                        "error": outcome.err(),
                    }),
                )
                .severity(severity)
                .correlated(escalation.order_id.as_str().to_string()),
            );
        }

        if escalation.settle(EscalationStatus::Completed) {
            info!(escalation_id = %escalation.id, "Escalation exhausted without acknowledgement");
            self.bus.publish(
                BusEvent::new(
                    "escalation.exhausted",
                    serde_json::json!({
                        "escalationId": escalation.id.to_string(),
                        "purpose": escalation.purpose.as_str(),
                        "orderId": escalation.order_id.as_str(),
                    }),
                )
                .severity(Severity::Medium)
                .correlated(escalation.order_id.as_str().to_string()),
            );
        }

        // Keep the record visible for a while, then prune.
        tokio::time::sleep(RETENTION).await;
        self.escalations
            .remove_if(&escalation.id, |_, current| !current.is_active());
    }

    async fn dispatch(
        &self,
        escalation: &Arc<Escalation>,
        step: &EscalationStep,
    ) -> std::result::Result<(), String> {
        info!(
            escalation_id = %escalation.id,
            channel = step.channel.as_str(),
            "Dispatching escalation step"
        );
        match step.channel {
            EscalationChannel::Push => {
                self.backend.notify_event(
                    "notify/push",
                    serde_json::json!({
                        "purpose": escalation.purpose.as_str(),
                        "orderId": escalation.order_id.as_str(),
                        "target": escalation.target,
                        "data": escalation.data,
                    }),
                );
                Ok(())
            }
            EscalationChannel::Chat => {
                self.backend.notify_event(
                    "notify/chat-template",
                    serde_json::json!({
                        "purpose": escalation.purpose.as_str(),
                        "orderId": escalation.order_id.as_str(),
                        "target": escalation.target,
                        "data": escalation.data,
                    }),
                );
                Ok(())
            }
            EscalationChannel::Ring => {
                let (order, party) = self.resolve_party(escalation).await?;
                self.telephony
                    .place_call(&PlaceCallRequest {
                        to: party.phone.clone(),
                        caller_id: self
                            .caller_ids
                            .for_target(escalation.target)
                            .to_string(),
                        purpose: escalation.purpose,
                        order_id: Some(order.id.clone()),
                        language: party
                            .preferred_language
                            .unwrap_or_default(),
                        record: false,
                        max_duration_secs: RING_CALL_SECS,
                    })
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            EscalationChannel::InteractiveVoice => {
                let (order, _party) = self.resolve_party(escalation).await?;
                self.orchestrator
                    .start_outbound(escalation.purpose, &order, None)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            EscalationChannel::HumanOperator => {
                self.bus.publish(
                    BusEvent::new(
                        "escalation.alert",
                        serde_json::json!({
                            "escalationId": escalation.id.to_string(),
                            "purpose": escalation.purpose.as_str(),
                            "orderId": escalation.order_id.as_str(),
                            "reason": "ladder reached human operator",
                        }),
                    )
                    .severity(Severity::High)
                    .correlated(escalation.order_id.as_str().to_string()),
                );
                Ok(())
            }
        }
    }

    async fn resolve_party(
        &self,
        escalation: &Arc<Escalation>,
    ) -> std::result::Result<(Order, Party), String> {
        let order = self
            .backend
            .get_order(&escalation.order_id)
            .await
            .map_err(|e| e.to_string())?;
        let party = match escalation.target {
            PartyKind::Vendor => order.vendor.clone(),
            PartyKind::Customer => order.customer.clone(),
            PartyKind::Rider => order
                .rider
                .clone()
                .ok_or_else(|| format!("order {} has no rider", order.id))?,
            PartyKind::Admin => return Err("admin is not an escalation target".to_string()),
        };
        Ok((order, party))
    }
}
