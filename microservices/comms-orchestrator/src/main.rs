//! Communications Orchestrator
//!
//! The nerve layer between the Core Backend and the Telephony Provider:
//! - Escalation ladders: push -> chat -> ring -> interactive voice ->
//!   human operator, cancellable and idempotent per order
//! - Per-call conversation state machines over keypad and speech input
//! - Speech provider registry with priority routing and failover
//! - Webhook/WebSocket gateway with HMAC-verified ingress

#![allow(dead_code)]

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dastak_core::{
    CommsError, CommsService, DependencyStatus, HealthStatus, ReadinessStatus, Result,
    ServiceRuntime,
};
use dastak_telephony_sdk::{TelephonyClient, WebhookSigner};

mod admin;
mod audio_cache;
mod backend;
mod config;
mod escalation;
mod events;
mod gateway;
mod orchestrator;
mod providers;
mod session;

use admin::AdminState;
use audio_cache::TemplateCache;
use backend::BackendClient;
use config::CommsConfig;
use escalation::EscalationEngine;
use events::{EventBus, OutboundQueue};
use gateway::GatewayState;
use orchestrator::{llm::LlmClient, Orchestrator};
use providers::{drivers::build_drivers, CapabilityRouter, ProviderRegistry, UsageMetrics};
use session::SessionStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    info!("Starting Communications Orchestrator");

    let config = CommsConfig::from_env()?;
    let service = Arc::new(CommsOrchestratorService::new(config)?);
    ServiceRuntime::run(service).await
}

pub struct CommsOrchestratorService {
    config: CommsConfig,
    store: Arc<SessionStore>,
    registry: Arc<ProviderRegistry>,
    usage: Arc<UsageMetrics>,
    clips: Arc<TemplateCache>,
    queue: OutboundQueue,
    bus: Arc<EventBus>,
    gateway: Arc<GatewayState>,
    admin: Arc<AdminState>,
    sweeper: Mutex<Option<CancellationToken>>,
    start_time: std::time::Instant,
}

impl CommsOrchestratorService {
    pub fn new(config: CommsConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let queue = OutboundQueue::new(config.queue_endpoint.clone(), bus.clone());
        let backend = Arc::new(BackendClient::new(
            config.backend_url.clone(),
            config.backend_token.clone(),
            config.default_language,
            queue.clone(),
        )?);

        let registry = Arc::new(ProviderRegistry::new(
            build_drivers(&config.providers),
            config.asr_priority.clone(),
            config.tts_priority.clone(),
        ));
        let usage = Arc::new(UsageMetrics::default());
        let router = Arc::new(CapabilityRouter::new(registry.clone(), usage.clone()));

        let clips = Arc::new(TemplateCache::new(config.audio_cache_bytes));
        let store = Arc::new(SessionStore::new(config.max_sessions, config.session_idle));

        // Missing telephony credentials refuse boot here.
        let telephony = Arc::new(
            TelephonyClient::new(config.telephony.clone())
                .map_err(|e| CommsError::Config(e.to_string()))?,
        );
        let llm = Arc::new(LlmClient::new(
            config.llm_url.clone(),
            config.llm_api_key.clone(),
        )?);

        let orchestrator = Orchestrator::new(
            store.clone(),
            router,
            clips.clone(),
            backend.clone(),
            telephony.clone(),
            bus.clone(),
            llm,
            config.caller_ids.clone(),
            config.operator_phone.clone(),
            config.default_language,
            config.default_voice.clone(),
        );
        let escalations = EscalationEngine::new(
            backend,
            telephony.clone(),
            orchestrator.clone(),
            bus.clone(),
            config.caller_ids.clone(),
        );

        let stream_token = telephony
            .signer()
            .sign(format!("{}/telephony/stream", config.telephony.callback_base).as_bytes());
        let gateway = Arc::new(GatewayState {
            orchestrator,
            escalations: escalations.clone(),
            telephony,
            bus: bus.clone(),
            signer: WebhookSigner::new(config.telephony.hmac_secret.clone().into_bytes()),
            stream_token,
            auth_failures: AtomicU64::new(0),
        });
        let admin = Arc::new(AdminState {
            escalations,
            registry: registry.clone(),
            usage: usage.clone(),
            store: store.clone(),
            clips: clips.clone(),
            queue: queue.clone(),
            gateway: gateway.clone(),
            token: config.admin_token.clone(),
        });

        Ok(Self {
            config,
            store,
            registry,
            usage,
            clips,
            queue,
            bus,
            gateway,
            admin,
            sweeper: Mutex::new(None),
            start_time: std::time::Instant::now(),
        })
    }
}

#[async_trait::async_trait]
impl CommsService for CommsOrchestratorService {
    fn service_id(&self) -> &'static str {
        "comms-orchestrator"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let asr = self.registry.priority(providers::ProviderKind::Asr);
        let tts = self.registry.priority(providers::ProviderKind::Tts);
        ReadinessStatus {
            ready: !asr.is_empty() && !tts.is_empty(),
            dependencies: vec![
                DependencyStatus {
                    name: "core-backend".to_string(),
                    available: true,
                    latency_ms: None,
                },
                DependencyStatus {
                    name: format!("asr-providers({})", asr.len()),
                    available: !asr.is_empty(),
                    latency_ms: None,
                },
                DependencyStatus {
                    name: format!("tts-providers({})", tts.len()),
                    available: !tts.is_empty(),
                    latency_ms: None,
                },
            ],
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!(
            sessions = self.store.len(),
            queued = self.queue.stats().pending,
            "Shutting down Communications Orchestrator"
        );
        if let Some(token) = self.sweeper.lock().take() {
            token.cancel();
        }
        self.store.drain();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let sweeper = self.store.spawn_sweeper(self.config.sweep_interval);
        *self.sweeper.lock() = Some(sweeper);

        let gateway_state = self.gateway.clone();
        let usage = self.usage.clone();
        let clips = self.clips.clone();
        let bus = self.bus.clone();

        let app = gateway::routes(gateway_state)
            .merge(admin::routes(self.admin.clone()))
            .route(
                "/health",
                axum::routing::get(|| async { axum::Json(serde_json::json!({ "healthy": true })) }),
            )
            .route(
                "/ready",
                axum::routing::get(move || {
                    let usage = usage.clone();
                    let clips = clips.clone();
                    let bus = bus.clone();
                    async move {
                        axum::Json(serde_json::json!({
                            "ready": true,
                            "providersTracked": usage.snapshot().providers.len(),
                            "audioCacheBytes": clips.stats().bytes,
                            "busEvents": bus.published_count(),
                        }))
                    }
                }),
            );

        info!(bind = %self.config.http_bind, "Gateway listening");
        let listener = tokio::net::TcpListener::bind(&self.config.http_bind).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}
