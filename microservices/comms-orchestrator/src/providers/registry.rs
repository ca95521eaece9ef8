//! Provider registry (C1)
//!
//! Tracks configured drivers, their priority order per capability, and a
//! health cache. Health entries are fresh for 30 seconds; first use after
//! expiry triggers a probe. A failed probe or failed request marks the
//! provider unavailable for one cache lifetime.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use dastak_core::{CommsError, Result};

use super::{ProviderKind, SpeechDriver};

const HEALTH_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct HealthRecord {
    available: bool,
    last_latency_ms: Option<u64>,
    checked_at: Instant,
}

/// Health as reported on the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub name: String,
    pub kind: ProviderKind,
    pub available: bool,
    pub last_latency_ms: Option<u64>,
    pub checked_secs_ago: u64,
}

pub struct ProviderRegistry {
    drivers: HashMap<&'static str, Arc<dyn SpeechDriver>>,
    priorities: RwLock<HashMap<ProviderKind, Vec<String>>>,
    health: DashMap<(ProviderKind, String), HealthRecord>,
}

impl ProviderRegistry {
    pub fn new(
        drivers: Vec<Arc<dyn SpeechDriver>>,
        asr_priority: Vec<String>,
        tts_priority: Vec<String>,
    ) -> Self {
        let drivers: HashMap<&'static str, Arc<dyn SpeechDriver>> =
            drivers.into_iter().map(|d| (d.name(), d)).collect();
        let mut priorities = HashMap::new();
        priorities.insert(ProviderKind::Asr, asr_priority);
        priorities.insert(ProviderKind::Tts, tts_priority);
        Self {
            drivers,
            priorities: RwLock::new(priorities),
            health: DashMap::new(),
        }
    }

    pub fn driver(&self, name: &str) -> Option<Arc<dyn SpeechDriver>> {
        self.drivers.get(name).cloned()
    }

    /// Candidate names for a request: the preferred provider first (if
    /// given), then the configured priority, duplicates removed. Only
    /// drivers that support the capability are listed.
    pub fn candidates(&self, kind: ProviderKind, preferred: Option<&str>) -> Vec<String> {
        let priorities = self.priorities.read();
        let configured = priorities.get(&kind).cloned().unwrap_or_default();
        let mut out: Vec<String> = Vec::with_capacity(configured.len() + 1);
        for name in preferred.into_iter().map(str::to_string).chain(configured) {
            if out.contains(&name) {
                continue;
            }
            let supported = self
                .drivers
                .get(name.as_str())
                .is_some_and(|d| d.supports(kind));
            if supported {
                out.push(name);
            }
        }
        out
    }

    /// Check health, probing if the cached entry expired.
    pub async fn is_available(&self, kind: ProviderKind, name: &str) -> bool {
        let key = (kind, name.to_string());
        if let Some(rec) = self.health.get(&key) {
            if rec.checked_at.elapsed() < HEALTH_TTL {
                return rec.available;
            }
        }
        let Some(driver) = self.drivers.get(name) else {
            return false;
        };
        let started = Instant::now();
        let available = driver.probe().await;
        let latency = started.elapsed().as_millis() as u64;
        debug!(provider = name, kind = kind.as_str(), available, latency_ms = latency, "Provider probed");
        self.health.insert(
            key,
            HealthRecord {
                available,
                last_latency_ms: Some(latency),
                checked_at: Instant::now(),
            },
        );
        available
    }

    /// Mark a provider unavailable for one cache lifetime after a failed
    /// request.
    pub fn mark_unavailable(&self, kind: ProviderKind, name: &str) {
        warn!(provider = name, kind = kind.as_str(), "Provider marked unavailable");
        self.health.insert(
            (kind, name.to_string()),
            HealthRecord {
                available: false,
                last_latency_ms: None,
                checked_at: Instant::now(),
            },
        );
    }

    /// Refresh the health entry after a successful request.
    pub fn record_success(&self, kind: ProviderKind, name: &str, latency_ms: u64) {
        self.health.insert(
            (kind, name.to_string()),
            HealthRecord {
                available: true,
                last_latency_ms: Some(latency_ms),
                checked_at: Instant::now(),
            },
        );
    }

    /// Replace a capability's priority list at runtime (memory only).
    pub fn set_priority(&self, kind: ProviderKind, list: Vec<String>) -> Result<()> {
        for name in &list {
            let supported = self
                .drivers
                .get(name.as_str())
                .is_some_and(|d| d.supports(kind));
            if !supported {
                return Err(CommsError::Validation(format!(
                    "{name} is not a configured {} provider",
                    kind.as_str()
                )));
            }
        }
        self.priorities.write().insert(kind, list);
        Ok(())
    }

    pub fn priority(&self, kind: ProviderKind) -> Vec<String> {
        self.priorities.read().get(&kind).cloned().unwrap_or_default()
    }

    pub fn health_snapshot(&self) -> Vec<HealthView> {
        self.health
            .iter()
            .map(|entry| {
                let ((kind, name), rec) = (entry.key().clone(), entry.value().clone());
                HealthView {
                    name,
                    kind,
                    available: rec.available,
                    last_latency_ms: rec.last_latency_ms,
                    checked_secs_ago: rec.checked_at.elapsed().as_secs(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{DriverOutcome, RecognizeRequest, SynthesizeRequest, Transcript};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct FakeDriver {
        name: &'static str,
        tts_only: bool,
        healthy: bool,
    }

    #[async_trait]
    impl SpeechDriver for FakeDriver {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, kind: ProviderKind) -> bool {
            !self.tts_only || kind == ProviderKind::Tts
        }

        async fn probe(&self) -> bool {
            self.healthy
        }

        async fn recognize(&self, _req: &RecognizeRequest) -> DriverOutcome<Transcript> {
            DriverOutcome::Ok(Transcript {
                text: "ok".into(),
                confidence: None,
            })
        }

        async fn synthesize(&self, _req: &SynthesizeRequest) -> DriverOutcome<Bytes> {
            DriverOutcome::Ok(Bytes::from_static(b"audio"))
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(
            vec![
                Arc::new(FakeDriver {
                    name: "alpha",
                    tts_only: false,
                    healthy: true,
                }),
                Arc::new(FakeDriver {
                    name: "beta",
                    tts_only: true,
                    healthy: true,
                }),
            ],
            vec!["alpha".into(), "beta".into()],
            vec!["beta".into(), "alpha".into()],
        )
    }

    #[test]
    fn candidates_respect_preference_and_dedupe() {
        let reg = registry();
        assert_eq!(
            reg.candidates(ProviderKind::Tts, Some("alpha")),
            vec!["alpha".to_string(), "beta".to_string()]
        );
        // beta is TTS-only, so it drops out of the ASR candidate list.
        assert_eq!(
            reg.candidates(ProviderKind::Asr, None),
            vec!["alpha".to_string()]
        );
    }

    #[tokio::test]
    async fn mark_unavailable_sticks_for_cache_lifetime() {
        let reg = registry();
        assert!(reg.is_available(ProviderKind::Asr, "alpha").await);
        reg.mark_unavailable(ProviderKind::Asr, "alpha");
        assert!(!reg.is_available(ProviderKind::Asr, "alpha").await);
    }

    #[test]
    fn set_priority_rejects_unknown_provider() {
        let reg = registry();
        assert!(reg
            .set_priority(ProviderKind::Asr, vec!["ghost".into()])
            .is_err());
        // beta does not do ASR either.
        assert!(reg
            .set_priority(ProviderKind::Asr, vec!["beta".into()])
            .is_err());
        assert!(reg
            .set_priority(ProviderKind::Tts, vec!["beta".into(), "alpha".into()])
            .is_ok());
    }
}
