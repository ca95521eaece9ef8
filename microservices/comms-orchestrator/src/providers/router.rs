//! Capability router (C2)
//!
//! Routes each recognition/synthesis request to the first healthy
//! provider from the candidate list and falls back on error. Every
//! attempt, failed or successful, lands in the usage metrics.

use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, warn};

use super::{
    DriverOutcome, ProviderKind, ProviderRegistry, RecognizeRequest, SynthesizeRequest,
    Transcript, UsageMetrics,
};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("all {} providers exhausted", .0.as_str())]
    ProvidersExhausted(ProviderKind),
}

pub struct CapabilityRouter {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<UsageMetrics>,
}

impl CapabilityRouter {
    pub fn new(registry: Arc<ProviderRegistry>, metrics: Arc<UsageMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<UsageMetrics> {
        &self.metrics
    }

    /// Speech-to-text via the first healthy provider. Returns the
    /// transcript and the provider that produced it.
    pub async fn recognize(
        &self,
        req: &RecognizeRequest,
        preferred: Option<&str>,
    ) -> Result<(Transcript, String), RouterError> {
        let kind = ProviderKind::Asr;
        let input_units = req.audio.len() as u64;
        for name in self.registry.candidates(kind, preferred) {
            if !self.registry.is_available(kind, &name).await {
                continue;
            }
            let driver = match self.registry.driver(&name) {
                Some(d) => d,
                None => continue,
            };
            let started = Instant::now();
            let outcome = tokio::time::timeout(kind.timeout(), driver.recognize(req)).await;
            let latency = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(DriverOutcome::Ok(transcript)) => {
                    self.metrics.record(kind, &name, true, latency, input_units);
                    self.registry.record_success(kind, &name, latency);
                    return Ok((transcript, name));
                }
                Ok(DriverOutcome::Retryable(e)) => {
                    self.metrics.record(kind, &name, false, latency, input_units);
                    self.registry.mark_unavailable(kind, &name);
                    warn!(provider = %name, error = %e, "Recognition failed, trying next");
                }
                Ok(DriverOutcome::Fatal(e)) => {
                    self.metrics.record(kind, &name, false, latency, input_units);
                    self.registry.mark_unavailable(kind, &name);
                    error!(provider = %name, error = %e, "Recognition rejected by provider");
                }
                Err(_) => {
                    self.metrics.record(kind, &name, false, latency, input_units);
                    self.registry.mark_unavailable(kind, &name);
                    warn!(provider = %name, "Recognition timed out, trying next");
                }
            }
        }
        Err(RouterError::ProvidersExhausted(kind))
    }

    /// Text-to-speech via the first healthy provider.
    pub async fn synthesize(
        &self,
        req: &SynthesizeRequest,
        preferred: Option<&str>,
    ) -> Result<(Bytes, String), RouterError> {
        let kind = ProviderKind::Tts;
        let input_units = req.text.chars().count() as u64;
        for name in self.registry.candidates(kind, preferred) {
            if !self.registry.is_available(kind, &name).await {
                continue;
            }
            let driver = match self.registry.driver(&name) {
                Some(d) => d,
                None => continue,
            };
            let started = Instant::now();
            let outcome = tokio::time::timeout(kind.timeout(), driver.synthesize(req)).await;
            let latency = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(DriverOutcome::Ok(audio)) => {
                    self.metrics.record(kind, &name, true, latency, input_units);
                    self.registry.record_success(kind, &name, latency);
                    return Ok((audio, name));
                }
                Ok(DriverOutcome::Retryable(e)) => {
                    self.metrics.record(kind, &name, false, latency, input_units);
                    self.registry.mark_unavailable(kind, &name);
                    warn!(provider = %name, error = %e, "Synthesis failed, trying next");
                }
                Ok(DriverOutcome::Fatal(e)) => {
                    self.metrics.record(kind, &name, false, latency, input_units);
                    self.registry.mark_unavailable(kind, &name);
                    error!(provider = %name, error = %e, "Synthesis rejected by provider");
                }
                Err(_) => {
                    self.metrics.record(kind, &name, false, latency, input_units);
                    self.registry.mark_unavailable(kind, &name);
                    warn!(provider = %name, "Synthesis timed out, trying next");
                }
            }
        }
        Err(RouterError::ProvidersExhausted(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::SpeechDriver;
    use async_trait::async_trait;
    use dastak_core::Language;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyDriver {
        name: &'static str,
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SpeechDriver for FlakyDriver {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, _kind: ProviderKind) -> bool {
            true
        }

        async fn probe(&self) -> bool {
            true
        }

        async fn recognize(&self, _req: &RecognizeRequest) -> DriverOutcome<Transcript> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                DriverOutcome::Retryable("transient".into())
            } else {
                DriverOutcome::Ok(Transcript {
                    text: format!("from {}", self.name),
                    confidence: Some(0.9),
                })
            }
        }
    }

    fn router(drivers: Vec<Arc<dyn SpeechDriver>>, priority: Vec<String>) -> CapabilityRouter {
        let registry = Arc::new(ProviderRegistry::new(
            drivers,
            priority.clone(),
            priority,
        ));
        CapabilityRouter::new(registry, Arc::new(UsageMetrics::default()))
    }

    fn req() -> RecognizeRequest {
        RecognizeRequest {
            audio: Bytes::from_static(&[0u8; 320]),
            language: Language::Hindi,
            hint: None,
        }
    }

    #[tokio::test]
    async fn falls_back_to_lower_priority_on_transient_failure() {
        let r = router(
            vec![
                Arc::new(FlakyDriver {
                    name: "primary",
                    fail_first: u32::MAX,
                    calls: AtomicU32::new(0),
                }),
                Arc::new(FlakyDriver {
                    name: "fallback",
                    fail_first: 0,
                    calls: AtomicU32::new(0),
                }),
            ],
            vec!["primary".into(), "fallback".into()],
        );

        let (transcript, provider) = r.recognize(&req(), None).await.unwrap();
        assert_eq!(provider, "fallback");
        assert_eq!(transcript.text, "from fallback");

        // Both the failed attempt and the successful one are recorded.
        let snap = r.metrics().snapshot();
        let primary = snap.providers.iter().find(|e| e.provider == "primary").unwrap();
        let fallback = snap.providers.iter().find(|e| e.provider == "fallback").unwrap();
        assert_eq!(primary.requests, 1);
        assert_eq!(primary.failures, 1);
        assert_eq!(fallback.requests, 1);
        assert_eq!(fallback.failures, 0);
    }

    #[tokio::test]
    async fn exhausts_when_every_provider_fails() {
        let r = router(
            vec![
                Arc::new(FlakyDriver {
                    name: "a",
                    fail_first: u32::MAX,
                    calls: AtomicU32::new(0),
                }),
                Arc::new(FlakyDriver {
                    name: "b",
                    fail_first: u32::MAX,
                    calls: AtomicU32::new(0),
                }),
            ],
            vec!["a".into(), "b".into()],
        );
        assert!(matches!(
            r.recognize(&req(), None).await,
            Err(RouterError::ProvidersExhausted(ProviderKind::Asr))
        ));
    }

    #[tokio::test]
    async fn preferred_provider_is_tried_first() {
        let r = router(
            vec![
                Arc::new(FlakyDriver {
                    name: "a",
                    fail_first: 0,
                    calls: AtomicU32::new(0),
                }),
                Arc::new(FlakyDriver {
                    name: "b",
                    fail_first: 0,
                    calls: AtomicU32::new(0),
                }),
            ],
            vec!["a".into(), "b".into()],
        );
        let (_, provider) = r.recognize(&req(), Some("b")).await.unwrap();
        assert_eq!(provider, "b");
    }

    #[tokio::test]
    async fn unhealthy_provider_is_skipped_for_cache_lifetime() {
        let r = router(
            vec![
                Arc::new(FlakyDriver {
                    name: "a",
                    fail_first: 1,
                    calls: AtomicU32::new(0),
                }),
                Arc::new(FlakyDriver {
                    name: "b",
                    fail_first: 0,
                    calls: AtomicU32::new(0),
                }),
            ],
            vec!["a".into(), "b".into()],
        );
        // First request fails over to b and marks a unhealthy.
        let (_, provider) = r.recognize(&req(), None).await.unwrap();
        assert_eq!(provider, "b");
        // Second request skips a entirely while the health entry is fresh.
        let (_, provider) = r.recognize(&req(), None).await.unwrap();
        assert_eq!(provider, "b");
        let snap = r.metrics().snapshot();
        let a = snap.providers.iter().find(|e| e.provider == "a").unwrap();
        assert_eq!(a.requests, 1);
    }
}
