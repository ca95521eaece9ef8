//! Speech provider abstraction
//!
//! One operation each for speech-to-text and text-to-speech, independent
//! of which external service implements it today. The registry tracks
//! configured drivers, priority order and health; the router picks the
//! first healthy candidate and falls back on failure.

pub mod drivers;
pub mod metrics;
pub mod registry;
pub mod router;

pub use metrics::{UsageMetrics, UsageSnapshot};
pub use registry::{HealthView, ProviderRegistry};
pub use router::{CapabilityRouter, RouterError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use dastak_core::Language;

/// Speech capability kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Asr,
    Tts,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asr => "asr",
            Self::Tts => "tts",
        }
    }

    /// Per-request timeout: short utterances vs synthesis.
    pub fn timeout(&self) -> std::time::Duration {
        match self {
            Self::Asr => std::time::Duration::from_secs(30),
            Self::Tts => std::time::Duration::from_secs(60),
        }
    }
}

/// Speech-to-text request
#[derive(Debug, Clone)]
pub struct RecognizeRequest {
    pub audio: Bytes,
    pub language: Language,
    /// Optional domain hint (menu item names, digits)
    pub hint: Option<String>,
}

/// Speech-to-text result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Text-to-speech request
#[derive(Debug, Clone)]
pub struct SynthesizeRequest {
    pub text: String,
    pub language: Language,
    pub voice: String,
}

/// Result of one driver call.
///
/// Drivers return this instead of throwing: the router consumes the
/// variants rather than catching arbitrary errors. `Retryable` means the
/// next candidate should be tried and this provider marked unhealthy;
/// `Fatal` means the request itself is bad for this driver.
#[derive(Debug)]
pub enum DriverOutcome<T> {
    Ok(T),
    Retryable(String),
    Fatal(String),
}

/// A configured speech provider driver
#[async_trait]
pub trait SpeechDriver: Send + Sync {
    /// Name used in priority lists and metrics
    fn name(&self) -> &'static str;

    fn supports(&self, kind: ProviderKind) -> bool;

    /// Health probe. Local drivers hit their health endpoint; cloud
    /// drivers report available iff a credential is configured.
    async fn probe(&self) -> bool;

    async fn recognize(&self, _req: &RecognizeRequest) -> DriverOutcome<Transcript> {
        DriverOutcome::Fatal(format!("{} does not support recognition", self.name()))
    }

    async fn synthesize(&self, _req: &SynthesizeRequest) -> DriverOutcome<Bytes> {
        DriverOutcome::Fatal(format!("{} does not support synthesis", self.name()))
    }
}
