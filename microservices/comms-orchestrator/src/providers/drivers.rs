//! Provider drivers
//!
//! Thin HTTP clients over each external speech service. Transport errors
//! and throttling map to `Retryable`; anything the request itself caused
//! maps to `Fatal`. Payload shapes are per-provider; nothing above this
//! module knows them.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;

use super::{DriverOutcome, ProviderKind, RecognizeRequest, SpeechDriver, SynthesizeRequest, Transcript};
use crate::config::ProviderCredentials;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the configured driver set from credentials.
pub fn build_drivers(creds: &ProviderCredentials) -> Vec<std::sync::Arc<dyn SpeechDriver>> {
    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(64)
        .build()
        .expect("provider HTTP client");

    vec![
        std::sync::Arc::new(LocalDriver {
            http: http.clone(),
            asr_url: creds.local_asr_url.clone(),
            tts_url: creds.local_tts_url.clone(),
        }),
        std::sync::Arc::new(DeepgramDriver {
            http: http.clone(),
            api_key: creds.deepgram_api_key.clone(),
        }),
        std::sync::Arc::new(ElevenLabsDriver {
            http: http.clone(),
            api_key: creds.elevenlabs_api_key.clone(),
        }),
        std::sync::Arc::new(GoogleDriver {
            http: http.clone(),
            api_key: creds.google_api_key.clone(),
        }),
        std::sync::Arc::new(AzureDriver {
            http,
            api_key: creds.azure_api_key.clone(),
            region: creds.azure_region.clone(),
        }),
    ]
}

fn retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

async fn classify_failure<T>(resp: reqwest::Response) -> DriverOutcome<T> {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    if retryable_status(status) {
        DriverOutcome::Retryable(format!("status {status}: {body}"))
    } else {
        DriverOutcome::Fatal(format!("status {status}: {body}"))
    }
}

/// Self-hosted inference box. The only driver with a real health probe.
pub struct LocalDriver {
    http: reqwest::Client,
    asr_url: Option<String>,
    tts_url: Option<String>,
}

#[derive(Deserialize)]
struct LocalTranscript {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl SpeechDriver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Asr => self.asr_url.is_some(),
            ProviderKind::Tts => self.tts_url.is_some(),
        }
    }

    async fn probe(&self) -> bool {
        let Some(base) = self.asr_url.as_ref().or(self.tts_url.as_ref()) else {
            return false;
        };
        let check = self.http.get(format!("{base}/health")).send();
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, check).await,
            Ok(Ok(resp)) if resp.status().is_success()
        )
    }

    async fn recognize(&self, req: &RecognizeRequest) -> DriverOutcome<Transcript> {
        let Some(base) = &self.asr_url else {
            return DriverOutcome::Fatal("local ASR not configured".into());
        };
        let result = self
            .http
            .post(format!("{base}/v1/recognize"))
            .query(&[("language", req.language.code())])
            .header("content-type", "audio/basic")
            .body(req.audio.clone())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<LocalTranscript>().await {
                Ok(t) => DriverOutcome::Ok(Transcript {
                    text: t.text,
                    confidence: t.confidence,
                }),
                Err(e) => DriverOutcome::Retryable(format!("bad transcript body: {e}")),
            },
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }

    async fn synthesize(&self, req: &SynthesizeRequest) -> DriverOutcome<Bytes> {
        let Some(base) = &self.tts_url else {
            return DriverOutcome::Fatal("local TTS not configured".into());
        };
        let result = self
            .http
            .post(format!("{base}/v1/synthesize"))
            .json(&serde_json::json!({
                "text": req.text,
                "language": req.language.code(),
                "voice": req.voice,
                "encoding": "mulaw",
                "sample_rate": 8000,
            }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(b) => DriverOutcome::Ok(b),
                Err(e) => DriverOutcome::Retryable(e.to_string()),
            },
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }
}

pub struct DeepgramDriver {
    http: reqwest::Client,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl SpeechDriver for DeepgramDriver {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    fn supports(&self, _kind: ProviderKind) -> bool {
        true
    }

    async fn probe(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn recognize(&self, req: &RecognizeRequest) -> DriverOutcome<Transcript> {
        let Some(key) = &self.api_key else {
            return DriverOutcome::Fatal("deepgram credential missing".into());
        };
        let result = self
            .http
            .post("https://api.deepgram.com/v1/listen")
            .query(&[
                ("language", req.language.code()),
                ("encoding", "mulaw"),
                ("sample_rate", "8000"),
            ])
            .header("authorization", format!("Token {key}"))
            .header("content-type", "audio/basic")
            .body(req.audio.clone())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<DeepgramResponse>().await {
                    Ok(body) => {
                        let alt = body
                            .results
                            .channels
                            .into_iter()
                            .next()
                            .and_then(|c| c.alternatives.into_iter().next());
                        match alt {
                            Some(a) => DriverOutcome::Ok(Transcript {
                                text: a.transcript,
                                confidence: a.confidence,
                            }),
                            None => DriverOutcome::Retryable("empty transcript".into()),
                        }
                    }
                    Err(e) => DriverOutcome::Retryable(format!("bad response body: {e}")),
                }
            }
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }

    async fn synthesize(&self, req: &SynthesizeRequest) -> DriverOutcome<Bytes> {
        let Some(key) = &self.api_key else {
            return DriverOutcome::Fatal("deepgram credential missing".into());
        };
        let result = self
            .http
            .post("https://api.deepgram.com/v1/speak")
            .query(&[("encoding", "mulaw"), ("sample_rate", "8000")])
            .header("authorization", format!("Token {key}"))
            .json(&serde_json::json!({ "text": req.text }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(b) => DriverOutcome::Ok(b),
                Err(e) => DriverOutcome::Retryable(e.to_string()),
            },
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }
}

/// Synthesis-only provider
pub struct ElevenLabsDriver {
    http: reqwest::Client,
    api_key: Option<String>,
}

#[async_trait]
impl SpeechDriver for ElevenLabsDriver {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    fn supports(&self, kind: ProviderKind) -> bool {
        kind == ProviderKind::Tts
    }

    async fn probe(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn synthesize(&self, req: &SynthesizeRequest) -> DriverOutcome<Bytes> {
        let Some(key) = &self.api_key else {
            return DriverOutcome::Fatal("elevenlabs credential missing".into());
        };
        let result = self
            .http
            .post(format!(
                "https://api.elevenlabs.io/v1/text-to-speech/{}",
                req.voice
            ))
            .query(&[("output_format", "ulaw_8000")])
            .header("xi-api-key", key)
            .json(&serde_json::json!({
                "text": req.text,
                "model_id": "eleven_multilingual_v2",
            }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(b) => DriverOutcome::Ok(b),
                Err(e) => DriverOutcome::Retryable(e.to_string()),
            },
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }
}

pub struct GoogleDriver {
    http: reqwest::Client,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct GoogleRecognizeResponse {
    #[serde(default)]
    results: Vec<GoogleResult>,
}

#[derive(Deserialize)]
struct GoogleResult {
    alternatives: Vec<GoogleAlternative>,
}

#[derive(Deserialize)]
struct GoogleAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct GoogleSynthesizeResponse {
    #[serde(rename = "audioContent")]
    audio_content: String,
}

#[async_trait]
impl SpeechDriver for GoogleDriver {
    fn name(&self) -> &'static str {
        "google"
    }

    fn supports(&self, _kind: ProviderKind) -> bool {
        true
    }

    async fn probe(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn recognize(&self, req: &RecognizeRequest) -> DriverOutcome<Transcript> {
        let Some(key) = &self.api_key else {
            return DriverOutcome::Fatal("google credential missing".into());
        };
        let result = self
            .http
            .post("https://speech.googleapis.com/v1/speech:recognize")
            .query(&[("key", key)])
            .json(&serde_json::json!({
                "config": {
                    "encoding": "MULAW",
                    "sampleRateHertz": 8000,
                    "languageCode": req.language.code(),
                },
                "audio": { "content": BASE64.encode(&req.audio) },
            }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<GoogleRecognizeResponse>().await {
                    Ok(body) => {
                        let alt = body
                            .results
                            .into_iter()
                            .next()
                            .and_then(|r| r.alternatives.into_iter().next());
                        match alt {
                            Some(a) => DriverOutcome::Ok(Transcript {
                                text: a.transcript,
                                confidence: a.confidence,
                            }),
                            None => DriverOutcome::Retryable("empty transcript".into()),
                        }
                    }
                    Err(e) => DriverOutcome::Retryable(format!("bad response body: {e}")),
                }
            }
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }

    async fn synthesize(&self, req: &SynthesizeRequest) -> DriverOutcome<Bytes> {
        let Some(key) = &self.api_key else {
            return DriverOutcome::Fatal("google credential missing".into());
        };
        let result = self
            .http
            .post("https://texttospeech.googleapis.com/v1/text:synthesize")
            .query(&[("key", key)])
            .json(&serde_json::json!({
                "input": { "text": req.text },
                "voice": { "languageCode": req.language.code() },
                "audioConfig": { "audioEncoding": "MULAW", "sampleRateHertz": 8000 },
            }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<GoogleSynthesizeResponse>().await {
                    Ok(body) => match BASE64.decode(body.audio_content) {
                        Ok(audio) => DriverOutcome::Ok(Bytes::from(audio)),
                        Err(e) => DriverOutcome::Retryable(format!("bad audio content: {e}")),
                    },
                    Err(e) => DriverOutcome::Retryable(format!("bad response body: {e}")),
                }
            }
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }
}

pub struct AzureDriver {
    http: reqwest::Client,
    api_key: Option<String>,
    region: String,
}

#[derive(Deserialize)]
struct AzureRecognizeResponse {
    #[serde(rename = "DisplayText", default)]
    display_text: String,
}

#[async_trait]
impl SpeechDriver for AzureDriver {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn supports(&self, _kind: ProviderKind) -> bool {
        true
    }

    async fn probe(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn recognize(&self, req: &RecognizeRequest) -> DriverOutcome<Transcript> {
        let Some(key) = &self.api_key else {
            return DriverOutcome::Fatal("azure credential missing".into());
        };
        let url = format!(
            "https://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1",
            self.region
        );
        let result = self
            .http
            .post(url)
            .query(&[("language", req.language.code())])
            .header("Ocp-Apim-Subscription-Key", key)
            .header("content-type", "audio/basic")
            .body(req.audio.clone())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<AzureRecognizeResponse>().await {
                    Ok(body) => DriverOutcome::Ok(Transcript {
                        text: body.display_text,
                        confidence: None,
                    }),
                    Err(e) => DriverOutcome::Retryable(format!("bad response body: {e}")),
                }
            }
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }

    async fn synthesize(&self, req: &SynthesizeRequest) -> DriverOutcome<Bytes> {
        let Some(key) = &self.api_key else {
            return DriverOutcome::Fatal("azure credential missing".into());
        };
        let url = format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
            self.region
        );
        let ssml = format!(
            "<speak version='1.0' xml:lang='{lang}'><voice xml:lang='{lang}' name='{voice}'>{text}</voice></speak>",
            lang = req.language.code(),
            voice = req.voice,
            text = req.text,
        );
        let result = self
            .http
            .post(url)
            .header("Ocp-Apim-Subscription-Key", key)
            .header("content-type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", "raw-8khz-8bit-mono-mulaw")
            .body(ssml)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(b) => DriverOutcome::Ok(b),
                Err(e) => DriverOutcome::Retryable(e.to_string()),
            },
            Ok(resp) => classify_failure(resp).await,
            Err(e) => DriverOutcome::Retryable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(retryable_status(429));
        assert!(retryable_status(503));
        assert!(retryable_status(408));
        assert!(!retryable_status(400));
        assert!(!retryable_status(401));
    }

    #[tokio::test]
    async fn cloud_probe_is_credential_presence() {
        let http = reqwest::Client::new();
        let with_key = DeepgramDriver {
            http: http.clone(),
            api_key: Some("k".into()),
        };
        let without = DeepgramDriver {
            http,
            api_key: None,
        };
        assert!(with_key.probe().await);
        assert!(!without.probe().await);
    }

    #[tokio::test]
    async fn tts_only_driver_rejects_recognition() {
        let driver = ElevenLabsDriver {
            http: reqwest::Client::new(),
            api_key: Some("k".into()),
        };
        assert!(!driver.supports(ProviderKind::Asr));
        let req = RecognizeRequest {
            audio: Bytes::new(),
            language: dastak_core::Language::Hindi,
            hint: None,
        };
        assert!(matches!(
            driver.recognize(&req).await,
            DriverOutcome::Fatal(_)
        ));
    }
}
