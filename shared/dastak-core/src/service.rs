//! Service infrastructure shared by the comms binaries

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use crate::error::Result;

/// Health status for liveness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Readiness status for readiness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
    pub latency_ms: Option<u64>,
}

/// Standard trait the comms services implement
#[async_trait]
pub trait CommsService: Send + Sync + 'static {
    /// Service identifier (e.g. "comms-orchestrator")
    fn service_id(&self) -> &'static str;

    /// Service version
    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Health check - is the service alive?
    async fn health(&self) -> HealthStatus;

    /// Readiness check - are the dependencies available?
    async fn ready(&self) -> ReadinessStatus;

    /// Graceful shutdown - cancel timers, drain sessions
    async fn shutdown(&self) -> Result<()>;

    /// Start the service (HTTP servers, sweepers, queue drainers)
    async fn start(&self) -> Result<()>;
}

/// Service runtime bootstrap with signal-aware shutdown
pub struct ServiceRuntime;

impl ServiceRuntime {
    /// Run a service with standard lifecycle management.
    ///
    /// Spawns `start`, waits for SIGINT/SIGTERM, then gives the service a
    /// chance to shut down cleanly before aborting the start task.
    pub async fn run<S: CommsService>(service: Arc<S>) -> Result<()> {
        let started = std::time::Instant::now();

        info!(
            service_id = service.service_id(),
            version = service.version(),
            "Starting service"
        );

        let starter = service.clone();
        let start_handle = tokio::spawn(async move {
            if let Err(e) = starter.start().await {
                tracing::error!(error = %e, "Service start failed");
            }
        });

        Self::wait_for_shutdown().await;
        info!("Shutdown signal received, stopping");

        if let Err(e) = service.shutdown().await {
            warn!(error = %e, "Error during shutdown");
        }
        start_handle.abort();

        info!(
            uptime_seconds = started.elapsed().as_secs(),
            "Service stopped"
        );
        Ok(())
    }

    async fn wait_for_shutdown() {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to listen for SIGTERM")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }
}
