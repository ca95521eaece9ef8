//! Core Backend client (C3)
//!
//! Every query and mutation against the Core Backend lives here, with
//! short-TTL caching and fallback. Mutations share one backoff
//! discipline: 0.5s * 2^n with +/-20% jitter, capped at 30s, 5 attempts.
//! A transition that still cannot be delivered is enqueued to the
//! durable outbound queue and the caller is told `Queued`.

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dastak_core::{
    CallId, CallOutcome, CommsError, Language, Order, OrderId, OrderState, Party, PartyId,
    PartyKind, PhoneNumber, Result,
};

use crate::events::OutboundQueue;

const ORDER_TTL: Duration = Duration::from_secs(30);
const PARTY_TTL: Duration = Duration::from_secs(120);
const MUTATION_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;

/// In-memory cache with a strict TTL upper bound.
pub struct TtlCache<K: Eq + Hash, V: Clone> {
    entries: DashMap<K, (V, Instant)>,
    ttl: Duration,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            let (value, stored_at) = entry.value();
            if stored_at.elapsed() < self.ttl {
                return Some(value.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now()));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }
}

/// Result of a transition report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAck {
    Applied,
    /// Backend unreachable; the report went to the durable queue
    Queued,
}

#[derive(Serialize)]
struct TransitionBody<'a> {
    to_state: &'a str,
    actor: &'a str,
    reason: &'a str,
}

#[derive(Serialize)]
struct CallResultBody<'a> {
    outcome: &'a CallOutcome,
    details: &'a serde_json::Value,
}

pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    default_language: Language,
    order_cache: TtlCache<OrderId, Order>,
    party_cache: TtlCache<PhoneNumber, Party>,
    /// Call ids whose result was already reported (idempotence guard)
    reported_calls: DashMap<CallId, ()>,
    queue: OutboundQueue,
}

impl BackendClient {
    pub fn new(
        base_url: String,
        token: String,
        default_language: Language,
        queue: OutboundQueue,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .build()
            .map_err(|e| CommsError::Internal(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            token,
            default_language,
            order_cache: TtlCache::new(ORDER_TTL),
            party_cache: TtlCache::new(PARTY_TTL),
            reported_calls: DashMap::new(),
            queue,
        })
    }

    /// Fetch an order view, served from cache for up to 30 seconds.
    pub async fn get_order(&self, order_id: &OrderId) -> Result<Order> {
        if let Some(order) = self.order_cache.get(order_id) {
            return Ok(order);
        }
        let resp = self
            .http
            .get(format!("{}/orders/{}", self.base_url, order_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Err(CommsError::NotFound(format!("order {order_id}")));
        }
        if !resp.status().is_success() {
            return Err(CommsError::Upstream(format!(
                "order lookup returned {}",
                resp.status()
            )));
        }
        let order: Order = resp
            .json()
            .await
            .map_err(|e| CommsError::Upstream(format!("bad order body: {e}")))?;
        self.order_cache.insert(order_id.clone(), order.clone());
        Ok(order)
    }

    /// Resolve a party by phone: vendor registry, then rider registry,
    /// then a synthesized customer record. Cached for 2 minutes.
    pub async fn lookup_party_by_phone(&self, phone: &PhoneNumber) -> Result<Party> {
        if let Some(party) = self.party_cache.get(phone) {
            return Ok(party);
        }
        for registry in ["vendors", "riders"] {
            let resp = self
                .http
                .get(format!(
                    "{}/{registry}/by-phone/{}",
                    self.base_url,
                    phone.as_str()
                ))
                .bearer_auth(&self.token)
                .send()
                .await?;
            if resp.status().is_success() {
                let party: Party = resp
                    .json()
                    .await
                    .map_err(|e| CommsError::Upstream(format!("bad party body: {e}")))?;
                self.party_cache.insert(phone.clone(), party.clone());
                return Ok(party);
            }
            if resp.status().as_u16() != 404 {
                warn!(registry, status = %resp.status(), "Party lookup degraded");
            }
        }
        // Unknown phone: treat as a customer with phone only.
        let party = Party {
            kind: PartyKind::Customer,
            id: PartyId::new(format!("cust:{}", phone.as_str())),
            phone: phone.clone(),
            display_name: String::new(),
            preferred_language: Some(self.default_language),
        };
        self.party_cache.insert(phone.clone(), party.clone());
        Ok(party)
    }

    /// Request an order state transition.
    ///
    /// A 409 from the backend is surfaced as `Conflict` and never
    /// retried. Transport failures retry with the shared backoff; after
    /// the final attempt the report goes to the durable queue.
    pub async fn report_transition(
        &self,
        order_id: &OrderId,
        to_state: OrderState,
        actor: &str,
        reason: &str,
    ) -> Result<TransitionAck> {
        let url = format!("{}/orders/{}/transition", self.base_url, order_id);
        let body = TransitionBody {
            to_state: to_state.as_str(),
            actor,
            reason,
        };

        for attempt in 0..MUTATION_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            match self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    self.order_cache.invalidate(order_id);
                    info!(order_id = %order_id, to_state = to_state.as_str(), "Transition applied");
                    return Ok(TransitionAck::Applied);
                }
                Ok(resp) if resp.status().as_u16() == 409 => {
                    let detail = resp.text().await.unwrap_or_default();
                    return Err(CommsError::Conflict(format!(
                        "transition to {} rejected: {detail}",
                        to_state.as_str()
                    )));
                }
                Ok(resp) => {
                    warn!(
                        order_id = %order_id,
                        attempt,
                        status = %resp.status(),
                        "Transition attempt failed"
                    );
                }
                Err(e) => {
                    warn!(order_id = %order_id, attempt, error = %e, "Transition transport failure");
                }
            }
        }

        self.queue.enqueue(
            order_id.as_str(),
            "order.transition",
            serde_json::json!({
                "orderId": order_id.as_str(),
                "toState": to_state.as_str(),
                "actor": actor,
                "reason": reason,
            }),
        )?;
        info!(order_id = %order_id, to_state = to_state.as_str(), "Transition queued for delivery");
        Ok(TransitionAck::Queued)
    }

    /// Report a call's terminal outcome. Idempotent on call id: repeat
    /// reports for the same call are absorbed here.
    pub async fn report_call_result(
        &self,
        call_id: &CallId,
        outcome: &CallOutcome,
        details: serde_json::Value,
    ) -> Result<()> {
        if self.reported_calls.insert(call_id.clone(), ()).is_some() {
            debug!(call_id = %call_id, "Call result already reported, skipping");
            return Ok(());
        }

        let url = format!("{}/calls/{}/result", self.base_url, call_id);
        let body = CallResultBody {
            outcome,
            details: &details,
        };
        for attempt in 0..MUTATION_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            match self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(call_id = %call_id, outcome = outcome.as_str(), "Call result reported");
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(call_id = %call_id, attempt, status = %resp.status(), "Call result attempt failed");
                }
                Err(e) => {
                    warn!(call_id = %call_id, attempt, error = %e, "Call result transport failure");
                }
            }
        }

        self.queue.enqueue(
            call_id.as_str(),
            "call.result",
            serde_json::json!({
                "callId": call_id.as_str(),
                "outcome": outcome,
                "details": details,
            }),
        )?;
        Ok(())
    }

    /// Best-effort notification; spawned, never fails the caller.
    pub fn notify_event(&self, kind: &str, payload: serde_json::Value) {
        let url = format!("{}/events/{kind}", self.base_url);
        let http = self.http.clone();
        let token = self.token.clone();
        let kind = kind.to_string();
        tokio::spawn(async move {
            match http.post(&url).bearer_auth(&token).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    debug!(kind = %kind, status = %resp.status(), "Notify event not accepted")
                }
                Err(e) => debug!(kind = %kind, error = %e, "Notify event failed"),
            }
        });
    }
}

/// Shared mutation backoff: 0.5s * 2^n, +/-20% jitter, capped at 30s.
/// `attempt` is 1-based: the first retry waits ~0.5s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = (BACKOFF_BASE_MS << attempt.saturating_sub(1).min(10)).min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis(((base as f64) * jitter).min(BACKOFF_CAP_MS as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_stays_within_jitter_bounds() {
        for attempt in 1u32..8 {
            let base = (BACKOFF_BASE_MS << (attempt - 1).min(10)).min(BACKOFF_CAP_MS) as f64;
            for _ in 0..20 {
                let d = backoff_delay(attempt).as_millis() as f64;
                assert!(d >= base * 0.8 - 1.0, "attempt {attempt}: {d} below jitter floor");
                assert!(d <= BACKOFF_CAP_MS as f64 + 1.0, "attempt {attempt}: {d} above cap");
            }
        }
        // First retry is about half a second.
        let first = backoff_delay(1).as_millis();
        assert!((400..=600).contains(&first));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_cache_expires_strictly() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(30));
        cache.insert("k".to_string(), 7);
        assert_eq!(cache.get(&"k".to_string()), Some(7));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get(&"k".to_string()), Some(7));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"k".to_string()), None);
    }
}
