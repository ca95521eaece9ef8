//! Conversation orchestrator (C6)
//!
//! One state machine per call. External events (`answered`, keypad
//! digits, speech, hangup, timeouts) fold into `(state, actions)`;
//! actions are dispatched from the session's own task, so events for a
//! call are processed strictly in receive order and no locks are needed
//! inside a session.

pub mod flows;
pub mod llm;


use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use dastak_core::{
    CallId, CallOutcome, CommsError, Language, Order, OrderState, Party, PhoneNumber, Purpose,
    Result,
};
use dastak_telephony_sdk::{CallStatus, PlaceCallRequest, TelephonyClient, FRAME_BYTES};

use crate::audio_cache::{ClipKey, TemplateCache};
use crate::backend::BackendClient;
use crate::config::CallerIds;
use crate::events::{BusEvent, EventBus, Severity};
use crate::providers::{CapabilityRouter, RecognizeRequest, SynthesizeRequest};
use crate::session::{CallSession, SessionStore, TurnRole};

use flows::{CallFlow, EntryOp, FlowState, InputKind, OutcomeSpec, Phrase};

/// Hard cap on open-ended turns per call
const OPEN_TURN_CAP: u8 = 10;
/// Turns of history handed to the language model
const LLM_HISTORY_TURNS: usize = 5;
/// Full call time limit, enforced at the Telephony Provider
const MAX_CALL_SECS: u32 = 30 * 60;
/// Session inbox depth; events beyond this apply backpressure upstream
const INBOX_DEPTH: usize = 64;

/// External events a call session reacts to
#[derive(Debug, Clone)]
pub enum CallEvent {
    Answered,
    Keypad { digit: char, seq: Option<u64> },
    Speech { text: String },
    Audio { audio: Bytes },
    RecordingReady { url: String, audio: Option<Bytes> },
    Interrupt,
    Hangup,
    Status(CallStatus),
}

pub struct Orchestrator {
    store: Arc<SessionStore>,
    router: Arc<CapabilityRouter>,
    clips: Arc<TemplateCache>,
    backend: Arc<BackendClient>,
    telephony: Arc<TelephonyClient>,
    bus: Arc<EventBus>,
    llm: Arc<llm::LlmClient>,
    caller_ids: CallerIds,
    operator_phone: PhoneNumber,
    default_language: Language,
    default_voice: String,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SessionStore>,
        router: Arc<CapabilityRouter>,
        clips: Arc<TemplateCache>,
        backend: Arc<BackendClient>,
        telephony: Arc<TelephonyClient>,
        bus: Arc<EventBus>,
        llm: Arc<llm::LlmClient>,
        caller_ids: CallerIds,
        operator_phone: PhoneNumber,
        default_language: Language,
        default_voice: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            router,
            clips,
            backend,
            telephony,
            bus,
            llm,
            caller_ids,
            operator_phone,
            default_language,
            default_voice,
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Place an outbound interactive call for a purpose. Pre-synthesizes
    /// the phrases near the entry node, then asks the provider to dial.
    pub async fn start_outbound(
        self: &Arc<Self>,
        purpose: Purpose,
        order: &Order,
        language: Option<Language>,
    ) -> Result<CallId> {
        let flow = CallFlow::for_purpose(purpose)
            .ok_or_else(|| CommsError::Validation(format!("{purpose} has no voice flow")))?;
        let party = self.party_for(purpose, order)?;
        let language = language
            .or(party.preferred_language)
            .unwrap_or(self.default_language);

        self.presynthesize(flow, Some(order), language).await;

        let call_id = self
            .telephony
            .place_call(&PlaceCallRequest {
                to: party.phone.clone(),
                caller_id: self.caller_ids.for_target(purpose.target()).to_string(),
                purpose,
                order_id: Some(order.id.clone()),
                language,
                record: flow.recorded,
                max_duration_secs: MAX_CALL_SECS,
            })
            .await
            .map_err(|e| CommsError::Upstream(e.to_string()))?;

        self.register_session(
            call_id.clone(),
            purpose,
            Some(order.clone()),
            Some(party),
            language,
        );
        Ok(call_id)
    }

    /// Adopt an inbound call: resolve the caller by phone and run the
    /// open-ended customer flow.
    pub async fn attach_inbound(
        self: &Arc<Self>,
        call_id: CallId,
        from: PhoneNumber,
    ) -> Result<Arc<CallSession>> {
        let party = self.backend.lookup_party_by_phone(&from).await?;
        let language = party.preferred_language.unwrap_or(self.default_language);
        let flow = CallFlow::for_purpose(Purpose::InboundCustomer)
            .expect("inbound flow is built in");
        self.presynthesize(flow, None, language).await;
        let session = self.register_session(
            call_id,
            Purpose::InboundCustomer,
            None,
            Some(party),
            language,
        );
        Ok(session)
    }

    /// Create the session and its owner task. Events delivered for the
    /// call id are serialized through the session inbox.
    pub fn register_session(
        self: &Arc<Self>,
        call_id: CallId,
        purpose: Purpose,
        order: Option<Order>,
        party: Option<Party>,
        language: Language,
    ) -> Arc<CallSession> {
        let flow = CallFlow::for_purpose(purpose).expect("session purposes have flows");
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let session = Arc::new(CallSession::new(
            call_id.clone(),
            purpose,
            order.as_ref().map(|o| o.id.clone()),
            party.as_ref().map(|p| p.id.clone()),
            language,
            tx,
        ));
        self.store.insert(session.clone());
        self.bus.publish(
            BusEvent::new(
                "call.session.started",
                serde_json::json!({
                    "callId": call_id.as_str(),
                    "purpose": purpose.as_str(),
                }),
            )
            .correlated(call_id.as_str().to_string()),
        );

        let task = SessionTask {
            orch: self.clone(),
            session: session.clone(),
            flow,
            order,
            reported: false,
            ended: false,
            entered: false,
            invalid_count: 0,
            reprompts_used: 0,
            open_turns: 0,
            recording: false,
            recording_url: None,
            current_prompt: None,
            deadline: None,
        };
        tokio::spawn(task.run(rx));
        session
    }

    /// Route an event to its session. Events for unknown calls are
    /// dropped with a warning; the provider may retransmit.
    pub async fn deliver(&self, call_id: &CallId, event: CallEvent) {
        let Some(session) = self.store.get(call_id) else {
            warn!(call_id = %call_id, "Event for unknown call dropped");
            return;
        };
        if let CallEvent::Keypad { seq, digit } = &event {
            if !session.accept_seq(*seq) {
                debug!(call_id = %call_id, digit = %digit, seq = ?seq, "Duplicate keypad event dropped");
                return;
            }
        }
        session.deliver(event).await;
    }

    fn party_for(&self, purpose: Purpose, order: &Order) -> Result<Party> {
        use dastak_core::PartyKind;
        match purpose.target() {
            PartyKind::Vendor => Ok(order.vendor.clone()),
            PartyKind::Customer => Ok(order.customer.clone()),
            PartyKind::Rider => order
                .rider
                .clone()
                .ok_or_else(|| CommsError::Validation(format!("order {} has no rider", order.id))),
            PartyKind::Admin => Err(CommsError::Validation("admin is not a call target".into())),
        }
    }

    fn clip_key(&self, phrase: Phrase, order: Option<&Order>, language: Language) -> ClipKey {
        let phrase_id = match (phrase.per_order(), order) {
            (true, Some(o)) => format!("{}:{}", phrase.id(), o.id),
            _ => phrase.id().to_string(),
        };
        ClipKey {
            phrase_id,
            language,
            voice: self.default_voice.clone(),
        }
    }

    /// Render and synthesize the phrases reachable from the entry node,
    /// caching the clips. Failures are logged and left to the in-call
    /// retry path; pre-synthesis never blocks placement.
    async fn presynthesize(&self, flow: &'static CallFlow, order: Option<&Order>, language: Language) {
        for phrase in flow.presynth_phrases() {
            let key = self.clip_key(phrase, order, language);
            if self.clips.get(&key).is_some() {
                continue;
            }
            let request = SynthesizeRequest {
                text: phrase.render(order),
                language,
                voice: self.default_voice.clone(),
            };
            match self.router.synthesize(&request, None).await {
                Ok((audio, provider)) => {
                    debug!(phrase = phrase.id(), provider = %provider, "Pre-synthesized clip");
                    self.clips.insert(key, audio);
                }
                Err(e) => {
                    warn!(phrase = phrase.id(), error = %e, "Pre-synthesis failed");
                }
            }
        }
    }
}

/// Per-call state machine runner. Owns all mutable call state; the only
/// way in is the session inbox.
struct SessionTask {
    orch: Arc<Orchestrator>,
    session: Arc<CallSession>,
    flow: &'static CallFlow,
    order: Option<Order>,
    reported: bool,
    ended: bool,
    entered: bool,
    invalid_count: u8,
    reprompts_used: u8,
    open_turns: u8,
    recording: bool,
    recording_url: Option<String>,
    current_prompt: Option<(Phrase, InputKind, u64)>,
    deadline: Option<Instant>,
}

impl SessionTask {
    async fn run(mut self, mut rx: mpsc::Receiver<CallEvent>) {
        let cancel = self.session.cancel.clone();
        loop {
            if self.ended {
                break;
            }
            let deadline = self.deadline;
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.on_teardown_without_terminal().await;
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        self.on_teardown_without_terminal().await;
                        break;
                    }
                },
                _ = async move { tokio::time::sleep_until(deadline.unwrap()).await },
                    if deadline.is_some() => {
                    self.deadline = None;
                    self.on_timeout().await;
                }
            }
        }
        self.orch.store.remove(&self.session.call_id);
        self.orch.bus.publish(
            BusEvent::new(
                "call.session.ended",
                serde_json::json!({ "callId": self.session.call_id.as_str() }),
            )
            .correlated(self.session.call_id.as_str().to_string()),
        );
    }

    async fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Answered => {
                if !self.entered {
                    self.entered = true;
                    self.enter(self.flow.entry).await;
                }
            }
            CallEvent::Status(status) => {
                if status.is_terminal() {
                    debug!(call_id = %self.session.call_id, status = ?status, "Terminal call status");
                    self.on_hangup().await;
                } else if status == CallStatus::Answered && !self.entered {
                    self.entered = true;
                    self.enter(self.flow.entry).await;
                }
            }
            CallEvent::Hangup => self.on_hangup().await,
            CallEvent::Keypad { digit, .. } => self.on_digit(digit).await,
            CallEvent::Speech { text } => self.on_speech(text).await,
            CallEvent::Audio { audio } => self.on_audio(audio).await,
            CallEvent::RecordingReady { url, audio } => {
                self.recording_url = Some(url);
                if self.awaiting() == Some(InputKind::OpenEnded) {
                    if let Some(audio) = audio {
                        self.on_audio(audio).await;
                    }
                }
            }
            CallEvent::Interrupt => {
                // Barge-in: stop outbound audio immediately and listen.
                self.session.outbound.clear();
            }
        }
    }

    fn state(&self) -> Option<&'static FlowState> {
        self.flow.state(&self.session.state())
    }

    fn awaiting(&self) -> Option<InputKind> {
        self.current_prompt.map(|(_, input, _)| input)
    }

    async fn enter(&mut self, mut id: &'static str) {
        loop {
            let Some(state) = self.flow.state(id) else {
                warn!(call_id = %self.session.call_id, state = id, "Unknown flow state");
                self.teardown().await;
                return;
            };
            self.session.set_state(id);
            self.reprompts_used = 0;
            self.current_prompt = None;
            self.deadline = None;

            for op in state.entry {
                self.run_op(op).await;
                if self.ended {
                    return;
                }
            }

            if state.terminal {
                self.teardown().await;
                return;
            }
            match state.auto_next {
                Some(next) => id = next,
                None => return,
            }
        }
    }

    async fn run_op(&mut self, op: &EntryOp) {
        match *op {
            EntryOp::Say(phrase) => {
                self.play(phrase).await;
            }
            EntryOp::Prompt {
                phrase,
                input,
                timeout_secs,
            } => {
                self.play(phrase).await;
                if !self.ended {
                    self.current_prompt = Some((phrase, input, timeout_secs));
                    self.deadline = Some(Instant::now() + Duration::from_secs(timeout_secs));
                }
            }
            EntryOp::BeginRecording => self.recording = true,
            EntryOp::EndRecording => self.recording = false,
            EntryOp::Report(spec) => self.report(spec).await,
            EntryOp::RequestTransition(to) => self.request_transition(to).await,
            EntryOp::AckEscalation => self.ack_escalation(),
            EntryOp::TransferOperator => {
                let phone = self.orch.operator_phone.clone();
                if let Err(e) = self.orch.telephony.transfer(&self.session.call_id, &phone).await {
                    warn!(call_id = %self.session.call_id, error = %e, "Transfer failed");
                }
            }
            EntryOp::Hangup => {
                if let Err(e) = self.orch.telephony.hangup(&self.session.call_id).await {
                    debug!(call_id = %self.session.call_id, error = %e, "Hangup request failed");
                }
            }
        }
    }

    /// Speak a phrase: cached clip if present, fresh synthesis with one
    /// retry otherwise. A second synthesis failure ends the call with
    /// the apology clip and a `failed_tts` outcome.
    async fn play(&mut self, phrase: Phrase) {
        let key = self
            .orch
            .clip_key(phrase, self.order.as_ref(), self.session.language);
        if let Some(audio) = self.orch.clips.get(&key) {
            self.enqueue_audio(audio);
            return;
        }
        let text = phrase.render(self.order.as_ref());
        match self.synthesize_with_retry(&text).await {
            Some(audio) => {
                self.orch.clips.insert(key, audio.clone());
                self.enqueue_audio(audio);
            }
            None => {
                self.fail_call(CallOutcome::FailedTts).await;
            }
        }
    }

    async fn synthesize_with_retry(&self, text: &str) -> Option<Bytes> {
        let request = SynthesizeRequest {
            text: text.to_string(),
            language: self.session.language,
            voice: self.orch.default_voice.clone(),
        };
        for attempt in 0..2 {
            match self.orch.router.synthesize(&request, None).await {
                Ok((audio, _)) => return Some(audio),
                Err(e) => {
                    warn!(
                        call_id = %self.session.call_id,
                        attempt,
                        error = %e,
                        "Synthesis attempt failed"
                    );
                }
            }
        }
        None
    }

    fn enqueue_audio(&self, audio: Bytes) {
        let frames = audio
            .chunks(FRAME_BYTES)
            .map(|c| audio.slice_ref(c))
            .collect::<Vec<_>>();
        self.session.outbound.push_clip(frames);
    }

    async fn on_digit(&mut self, digit: char) {
        let Some(state) = self.state() else { return };

        if self.recording {
            if let Some((terminator, target)) = state.terminator {
                if digit == terminator {
                    self.deadline = None;
                    self.enter(target).await;
                }
            }
            return;
        }

        if state.on_digit.is_empty() {
            debug!(call_id = %self.session.call_id, digit = %digit, "Digit ignored in this state");
            return;
        }

        if let Some((_, target)) = state.on_digit.iter().find(|(d, _)| *d == digit) {
            self.deadline = None;
            self.invalid_count = 0;
            self.enter(target).await;
            return;
        }

        // Out-of-set digit: re-prompt within budget, then give up the
        // same way a timeout would.
        self.invalid_count += 1;
        if self.invalid_count <= state.reprompt_budget {
            match state.invalid_to {
                Some(invalid) => self.enter(invalid).await,
                None => self.replay_prompt().await,
            }
        } else {
            self.give_up(state).await;
        }
    }

    async fn on_timeout(&mut self) {
        let Some(state) = self.state() else { return };
        if self.awaiting() == Some(InputKind::OpenEnded) {
            self.enter(state.on_timeout.unwrap_or("closing")).await;
            return;
        }
        self.reprompts_used += 1;
        if self.reprompts_used <= state.reprompt_budget {
            self.replay_prompt().await;
        } else {
            self.give_up(state).await;
        }
    }

    async fn give_up(&mut self, state: &'static FlowState) {
        match state.on_timeout {
            Some(target) => self.enter(target).await,
            None => {
                self.report(OutcomeSpec::NoAction).await;
                self.teardown().await;
            }
        }
    }

    async fn replay_prompt(&mut self) {
        if let Some((phrase, _, timeout_secs)) = self.current_prompt {
            self.play(phrase).await;
            if !self.ended {
                self.deadline = Some(Instant::now() + Duration::from_secs(timeout_secs));
            }
        }
    }

    async fn on_hangup(&mut self) {
        if self.ended {
            return;
        }
        if self.recording {
            self.recording = false;
        }
        match self.state().and_then(|s| s.on_hangup) {
            Some(target) => self.enter(target).await,
            None => {
                if !self.reported {
                    self.report(OutcomeSpec::NoAction).await;
                }
                self.teardown().await;
            }
        }
    }

    /// Open-ended conversation turn: caller text in, language-model
    /// reply synthesized back out.
    async fn on_speech(&mut self, text: String) {
        if self.awaiting() != Some(InputKind::OpenEnded) {
            debug!(call_id = %self.session.call_id, "Speech ignored outside open-ended state");
            return;
        }
        self.session.push_turn(TurnRole::Caller, text.clone());
        self.open_turns += 1;
        if self.open_turns > OPEN_TURN_CAP {
            info!(call_id = %self.session.call_id, "Open-ended turn cap reached");
            self.enter("closing").await;
            return;
        }

        let history = self.session.recent_turns(LLM_HISTORY_TURNS);
        let reply = match self
            .orch
            .llm
            .reply(&text, &history, self.session.language)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(call_id = %self.session.call_id, error = %e, "Language model failed");
                self.fail_call(CallOutcome::FailedBackend).await;
                return;
            }
        };
        self.session.push_turn(TurnRole::System, reply.clone());

        match self.synthesize_with_retry(&reply).await {
            Some(audio) => {
                self.enqueue_audio(audio);
                if let Some((_, _, timeout_secs)) = self.current_prompt {
                    self.deadline = Some(Instant::now() + Duration::from_secs(timeout_secs));
                }
            }
            None => self.fail_call(CallOutcome::FailedTts).await,
        }
    }

    /// Streamed utterance or recording audio: recognize, then treat as
    /// speech. Recognition retries once before failing the call.
    async fn on_audio(&mut self, audio: Bytes) {
        if self.awaiting() != Some(InputKind::OpenEnded) {
            debug!(call_id = %self.session.call_id, "Audio ignored outside open-ended state");
            return;
        }
        let request = RecognizeRequest {
            audio,
            language: self.session.language,
            hint: None,
        };
        for attempt in 0..2 {
            match self.orch.router.recognize(&request, None).await {
                Ok((transcript, _)) => {
                    self.on_speech(transcript.text).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        call_id = %self.session.call_id,
                        attempt,
                        error = %e,
                        "Recognition attempt failed"
                    );
                }
            }
        }
        self.fail_call(CallOutcome::FailedAsr).await;
    }

    async fn report(&mut self, spec: OutcomeSpec) {
        let (outcome, details) = self.resolve_outcome(spec);
        self.report_outcome(outcome, details).await;
    }

    fn resolve_outcome(&self, spec: OutcomeSpec) -> (CallOutcome, serde_json::Value) {
        let order_id = self.session.order_id.as_ref().map(|o| o.as_str().to_string());
        match spec {
            OutcomeSpec::AcceptedPrep(minutes) => (
                CallOutcome::Accepted {
                    prep_minutes: Some(minutes),
                },
                serde_json::json!({ "orderId": order_id, "accepted": true, "prepMinutes": minutes }),
            ),
            OutcomeSpec::Accepted => (
                CallOutcome::Accepted { prep_minutes: None },
                serde_json::json!({ "orderId": order_id, "accepted": true }),
            ),
            OutcomeSpec::Rejected => (
                CallOutcome::Rejected {
                    reason_recording: self.recording_url.clone(),
                },
                serde_json::json!({ "orderId": order_id, "accepted": false }),
            ),
            OutcomeSpec::Confirmed => (
                CallOutcome::Confirmed,
                serde_json::json!({ "orderId": order_id }),
            ),
            OutcomeSpec::NoAction => (
                CallOutcome::NoAction,
                serde_json::json!({ "orderId": order_id }),
            ),
            OutcomeSpec::Extended(minutes) => (
                CallOutcome::Completed,
                serde_json::json!({ "orderId": order_id, "extendedMinutes": minutes }),
            ),
            OutcomeSpec::Transferred => (
                CallOutcome::Completed,
                serde_json::json!({ "orderId": order_id, "transferred": true }),
            ),
            OutcomeSpec::Completed => (
                CallOutcome::Completed,
                serde_json::json!({ "orderId": order_id, "turns": self.session.turn_count() }),
            ),
        }
    }

    /// Exactly one terminal report per call; later reports are dropped
    /// here before they reach the backend.
    async fn report_outcome(&mut self, outcome: CallOutcome, details: serde_json::Value) {
        if self.reported {
            return;
        }
        self.reported = true;
        self.orch.bus.publish(
            BusEvent::new(
                "call.result",
                serde_json::json!({
                    "callId": self.session.call_id.as_str(),
                    "purpose": self.session.purpose.as_str(),
                    "outcome": outcome,
                    "details": details,
                }),
            )
            .correlated(self.session.call_id.as_str().to_string()),
        );
        if let Err(e) = self
            .orch
            .backend
            .report_call_result(&self.session.call_id, &outcome, details)
            .await
        {
            warn!(call_id = %self.session.call_id, error = %e, "Call result report degraded");
        }
    }

    async fn request_transition(&mut self, to: OrderState) {
        let Some(order_id) = self.session.order_id.clone() else {
            return;
        };
        match self
            .orch
            .backend
            .report_transition(
                &order_id,
                to,
                "voice-orchestrator",
                self.session.purpose.as_str(),
            )
            .await
        {
            Ok(ack) => debug!(order_id = %order_id, ?ack, "Transition requested"),
            Err(e) => warn!(order_id = %order_id, error = %e, "Transition rejected"),
        }
    }

    fn ack_escalation(&self) {
        let Some(order_id) = self.session.order_id.as_ref() else {
            return;
        };
        self.orch.bus.publish(
            BusEvent::new(
                "escalation.ack",
                serde_json::json!({
                    "purpose": self.session.purpose.as_str(),
                    "orderId": order_id.as_str(),
                    "callId": self.session.call_id.as_str(),
                }),
            )
            .correlated(order_id.as_str().to_string()),
        );
    }

    /// Failure path that is audible: apology in the session language,
    /// outcome reported, hang up. Never leaves the line silent.
    async fn fail_call(&mut self, outcome: CallOutcome) {
        if self.ended {
            return;
        }
        let key = self
            .orch
            .clip_key(Phrase::Apology, self.order.as_ref(), self.session.language);
        if let Some(audio) = self.orch.clips.get(&key) {
            self.enqueue_audio(audio);
        }
        let details = serde_json::json!({
            "callId": self.session.call_id.as_str(),
            "state": self.session.state(),
        });
        self.report_outcome(outcome, details).await;
        if let Err(e) = self.orch.telephony.hangup(&self.session.call_id).await {
            debug!(call_id = %self.session.call_id, error = %e, "Hangup after failure failed");
        }
        self.ended = true;
    }

    /// Session torn down externally (inactivity sweep, shutdown) before
    /// any terminal state: still emit the one terminal report.
    async fn on_teardown_without_terminal(&mut self) {
        if !self.reported {
            self.report(OutcomeSpec::NoAction).await;
        }
        self.ended = true;
    }

    async fn teardown(&mut self) {
        self.ended = true;
    }
}
