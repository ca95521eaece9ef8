//! Call session management (C4)
//!
//! One `CallSession` per active phone call, keyed by the provider call
//! id. All events for a call are serialized onto the session's inbox
//! task, so nothing inside a session needs a lock; what lives here is
//! the cross-session map, the shared audio queues, and the observability
//! view.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dastak_core::{CallId, Language, OrderId, PartyId, Purpose};

use crate::orchestrator::CallEvent;

/// Conversation turns kept per session
pub const MAX_TURNS: usize = 20;
/// Outbound audio frames queued per session (~2s at 20ms frames)
const OUTBOUND_FRAME_CAP: usize = 100;
/// Inbound audio buffered per utterance
const INBOUND_BUFFER_CAP: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Caller,
    System,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Bounded per-session queue of outbound audio frames.
///
/// Frames are drained by the stream writer in push order, so the wire
/// order always matches synthesis completion order. Over the cap the
/// oldest frames are shed rather than buffering unboundedly.
pub struct OutboundAudio {
    frames: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl OutboundAudio {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push_clip(&self, frames: impl IntoIterator<Item = Bytes>) {
        let mut queue = self.frames.lock();
        for frame in frames {
            if queue.len() >= OUTBOUND_FRAME_CAP {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(frame);
        }
        drop(queue);
        // notify_one stores a permit, so a push racing the consumer's
        // re-check cannot be lost.
        self.notify.notify_one();
    }

    /// Next frame, waiting until one is available. Single consumer: the
    /// stream writer task.
    pub async fn next(&self) -> Bytes {
        loop {
            if let Some(frame) = self.frames.lock().pop_front() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    /// Drop everything queued (barge-in).
    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    pub fn queued(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for OutboundAudio {
    fn default() -> Self {
        Self::new()
    }
}

/// Active call session
pub struct CallSession {
    pub call_id: CallId,
    pub purpose: Purpose,
    pub order_id: Option<OrderId>,
    pub party_id: Option<PartyId>,
    pub language: Language,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub outbound: OutboundAudio,

    inbox: mpsc::Sender<CallEvent>,
    state: Mutex<String>,
    turns: Mutex<VecDeque<ConversationTurn>>,
    inbound: Mutex<BytesMut>,
    last_activity: Mutex<Instant>,
    /// Highest keypad sequence number processed; 0 means none seen
    last_seq: AtomicU64,
}

impl CallSession {
    pub fn new(
        call_id: CallId,
        purpose: Purpose,
        order_id: Option<OrderId>,
        party_id: Option<PartyId>,
        language: Language,
        inbox: mpsc::Sender<CallEvent>,
    ) -> Self {
        Self {
            call_id,
            purpose,
            order_id,
            party_id,
            language,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            outbound: OutboundAudio::new(),
            inbox,
            state: Mutex::new("await_answer".to_string()),
            turns: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(BytesMut::new()),
            last_activity: Mutex::new(Instant::now()),
            last_seq: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn set_state(&self, state: &str) {
        *self.state.lock() = state.to_string();
    }

    pub fn state(&self) -> String {
        self.state.lock().clone()
    }

    /// Duplicate/out-of-order guard for sequenced keypad events. Returns
    /// false when the event is stale and must be dropped.
    pub fn accept_seq(&self, seq: Option<u64>) -> bool {
        let Some(seq) = seq else {
            return true;
        };
        let mut current = self.last_seq.load(Ordering::Acquire);
        loop {
            if seq <= current {
                return false;
            }
            match self.last_seq.compare_exchange_weak(
                current,
                seq,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Enqueue an event onto the session task, preserving receive order.
    pub async fn deliver(&self, event: CallEvent) {
        self.touch();
        if self.inbox.send(event).await.is_err() {
            warn!(call_id = %self.call_id, "Session inbox closed, event dropped");
        }
    }

    pub fn push_turn(&self, role: TurnRole, text: String) {
        let mut turns = self.turns.lock();
        if turns.len() >= MAX_TURNS {
            turns.pop_front();
        }
        turns.push_back(ConversationTurn {
            role,
            text,
            at: Utc::now(),
        });
    }

    pub fn recent_turns(&self, n: usize) -> Vec<ConversationTurn> {
        let turns = self.turns.lock();
        turns.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.lock().len()
    }

    /// Append inbound stream audio, shedding the oldest bytes over cap.
    pub fn buffer_inbound(&self, chunk: &[u8]) {
        let mut buf = self.inbound.lock();
        if buf.len() + chunk.len() > INBOUND_BUFFER_CAP {
            let excess = buf.len() + chunk.len() - INBOUND_BUFFER_CAP;
            let split_at = excess.min(buf.len());
            let keep = buf.split_off(split_at);
            *buf = keep;
        }
        buf.extend_from_slice(chunk);
    }

    /// Take the buffered utterance, leaving the buffer empty.
    pub fn take_inbound(&self) -> Bytes {
        self.inbound.lock().split().freeze()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            call_id: self.call_id.clone(),
            purpose: self.purpose,
            order_id: self.order_id.clone(),
            language: self.language,
            state: self.state(),
            started_at: self.started_at,
            idle_secs: self.idle_for().as_secs(),
            turns: self.turn_count(),
            outbound_queued: self.outbound.queued(),
        }
    }
}

/// Read-only session view for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub call_id: CallId,
    pub purpose: Purpose,
    pub order_id: Option<OrderId>,
    pub language: Language,
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub turns: usize,
    pub outbound_queued: usize,
}

/// Cross-session map with a soft capacity ceiling and an inactivity
/// sweeper.
pub struct SessionStore {
    sessions: DashMap<CallId, Arc<CallSession>>,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            idle_timeout,
        }
    }

    /// Insert a session. Over the soft cap the least-recently-active
    /// session is evicted (and cancelled) to make room.
    pub fn insert(&self, session: Arc<CallSession>) {
        if self.sessions.len() >= self.max_sessions {
            if let Some(victim) = self.least_recently_active() {
                warn!(call_id = %victim, "Session cap reached, evicting least-recently-active");
                self.remove(&victim);
            }
        }
        self.sessions.insert(session.call_id.clone(), session);
    }

    fn least_recently_active(&self) -> Option<CallId> {
        self.sessions
            .iter()
            .max_by_key(|entry| entry.value().idle_for())
            .map(|entry| entry.key().clone())
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.sessions.get(call_id).map(|s| s.value().clone())
    }

    /// Remove and cancel a session. Idempotent.
    pub fn remove(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        let removed = self.sessions.remove(call_id).map(|(_, s)| s);
        if let Some(session) = &removed {
            session.cancel.cancel();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.value().info()).collect()
    }

    /// Evict sessions idle past the timeout. Returns how many went.
    pub fn sweep(&self) -> usize {
        let stale: Vec<CallId> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() > self.idle_timeout)
            .map(|e| e.key().clone())
            .collect();
        for call_id in &stale {
            info!(call_id = %call_id, "Evicting inactive session");
            self.remove(call_id);
        }
        stale.len()
    }

    /// Cancel everything (shutdown path).
    pub fn drain(&self) {
        let all: Vec<CallId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for call_id in all {
            self.remove(&call_id);
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let store = self.clone();
        let child = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.sweep();
                        if evicted > 0 {
                            info!(evicted, "Session sweep complete");
                        }
                    }
                }
            }
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Arc<CallSession> {
        let (tx, _rx) = mpsc::channel(16);
        Arc::new(CallSession::new(
            CallId::new(id),
            Purpose::VendorNewOrder,
            Some(OrderId::new("O-1")),
            None,
            Language::Hindi,
            tx,
        ))
    }

    #[tokio::test]
    async fn seq_dedupe_drops_stale_events() {
        let s = session("C-9");
        assert!(s.accept_seq(Some(7)));
        assert!(!s.accept_seq(Some(7)), "retransmitted seq must be dropped");
        assert!(!s.accept_seq(Some(3)), "older seq must be dropped");
        assert!(s.accept_seq(Some(8)));
        assert!(s.accept_seq(None), "unsequenced events always pass");
    }

    #[tokio::test]
    async fn conversation_ring_is_bounded() {
        let s = session("C-1");
        for i in 0..(MAX_TURNS + 5) {
            s.push_turn(TurnRole::Caller, format!("turn {i}"));
        }
        assert_eq!(s.turn_count(), MAX_TURNS);
        let recent = s.recent_turns(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent.last().unwrap().text, format!("turn {}", MAX_TURNS + 4));
    }

    #[tokio::test]
    async fn outbound_queue_sheds_oldest_over_cap() {
        let s = session("C-2");
        let frames: Vec<Bytes> = (0..(OUTBOUND_FRAME_CAP + 10))
            .map(|i| Bytes::from(vec![i as u8; 4]))
            .collect();
        s.outbound.push_clip(frames);
        assert_eq!(s.outbound.queued(), OUTBOUND_FRAME_CAP);
        assert_eq!(s.outbound.dropped(), 10);
        // The oldest frames are the ones that went.
        let first = s.outbound.next().await;
        assert_eq!(first[0], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn store_evicts_least_recently_active_over_cap() {
        let store = SessionStore::new(2, Duration::from_secs(1800));
        let a = session("C-a");
        let b = session("C-b");
        store.insert(a.clone());
        store.insert(b.clone());

        // Age both, then refresh b so a is the stalest.
        tokio::time::advance(Duration::from_secs(60)).await;
        b.touch();

        store.insert(session("C-c"));
        assert_eq!(store.len(), 2);
        assert!(store.get(&CallId::new("C-a")).is_none());
        assert!(a.cancel.is_cancelled());
        assert!(store.get(&CallId::new("C-c")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_sessions_and_cancels_them() {
        let store = SessionStore::new(100, Duration::from_secs(1800));
        let s = session("C-idle");
        store.insert(s.clone());

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
        assert!(s.cancel.is_cancelled());
    }
}
