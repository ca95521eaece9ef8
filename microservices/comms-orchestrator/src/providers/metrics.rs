//! Usage metrics per (capability, provider)
//!
//! Monotone counters plus a latency sum; averages are derived at
//! snapshot time for the stats endpoint.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::ProviderKind;

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    failures: AtomicU64,
    latency_ms_total: AtomicU64,
    input_units_total: AtomicU64,
}

#[derive(Debug, Default)]
pub struct UsageMetrics {
    per_provider: DashMap<(ProviderKind, String), Arc<Counters>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEntry {
    pub kind: ProviderKind,
    pub provider: String,
    pub requests: u64,
    pub failures: u64,
    /// Bytes for audio in, characters for text in
    pub input_units: u64,
    pub avg_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub providers: Vec<UsageEntry>,
}

impl UsageMetrics {
    fn counters(&self, kind: ProviderKind, provider: &str) -> Arc<Counters> {
        self.per_provider
            .entry((kind, provider.to_string()))
            .or_default()
            .clone()
    }

    /// Record one attempt against a provider, failed or not. Failed
    /// attempts count toward requests so fallback chains are visible.
    pub fn record(
        &self,
        kind: ProviderKind,
        provider: &str,
        ok: bool,
        latency_ms: u64,
        input_units: u64,
    ) {
        let counters = self.counters(kind, provider);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .latency_ms_total
            .fetch_add(latency_ms, Ordering::Relaxed);
        counters
            .input_units_total
            .fetch_add(input_units, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let mut providers: Vec<UsageEntry> = self
            .per_provider
            .iter()
            .map(|entry| {
                let (kind, provider) = entry.key().clone();
                let c = entry.value();
                let requests = c.requests.load(Ordering::Relaxed);
                UsageEntry {
                    kind,
                    provider,
                    requests,
                    failures: c.failures.load(Ordering::Relaxed),
                    input_units: c.input_units_total.load(Ordering::Relaxed),
                    avg_latency_ms: (requests > 0)
                        .then(|| c.latency_ms_total.load(Ordering::Relaxed) / requests),
                }
            })
            .collect();
        providers.sort_by(|a, b| (a.kind.as_str(), &a.provider).cmp(&(b.kind.as_str(), &b.provider)));
        UsageSnapshot { providers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_failures_and_derives_average() {
        let metrics = UsageMetrics::default();
        metrics.record(ProviderKind::Asr, "local", false, 100, 320);
        metrics.record(ProviderKind::Asr, "deepgram", true, 300, 320);
        metrics.record(ProviderKind::Asr, "deepgram", true, 100, 320);

        let snap = metrics.snapshot();
        let local = snap
            .providers
            .iter()
            .find(|e| e.provider == "local")
            .unwrap();
        assert_eq!(local.requests, 1);
        assert_eq!(local.failures, 1);

        let deepgram = snap
            .providers
            .iter()
            .find(|e| e.provider == "deepgram")
            .unwrap();
        assert_eq!(deepgram.requests, 2);
        assert_eq!(deepgram.failures, 0);
        assert_eq!(deepgram.avg_latency_ms, Some(200));
        assert_eq!(deepgram.input_units, 640);
    }
}
