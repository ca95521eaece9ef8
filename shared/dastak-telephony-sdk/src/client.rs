//! Outbound Telephony Provider client
//!
//! Places calls, hangs up, transfers. Placement retries transport
//! failures with exponential backoff; business rejections from the
//! provider are surfaced, never retried.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use dastak_core::{CallId, Language, OrderId, PhoneNumber, Purpose};

use crate::signature::WebhookSigner;
use crate::{Result, TelephonyError};

const PLACE_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Telephony Provider credentials and endpoints
#[derive(Debug, Clone)]
pub struct TelephonyConfig {
    pub api_base: String,
    pub account_id: String,
    pub api_key: String,
    pub auth_token: String,
    /// Public base URL of our gateway, embedded in callback URLs
    pub callback_base: String,
    pub hmac_secret: String,
}

impl TelephonyConfig {
    /// Boot-time validation. Missing credentials are fatal for the
    /// process; no partial telephony functionality is served.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("TELEPHONY_ACCOUNT_ID", &self.account_id),
            ("TELEPHONY_API_KEY", &self.api_key),
            ("TELEPHONY_AUTH_TOKEN", &self.auth_token),
            ("TELEPHONY_HMAC_SECRET", &self.hmac_secret),
        ] {
            if value.is_empty() {
                return Err(TelephonyError::MissingCredentials(name.to_string()));
            }
        }
        Ok(())
    }
}

/// Call lifecycle states reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Ringing,
    Answered,
    Completed,
    NoAnswer,
    Busy,
    Failed,
}

impl CallStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "ringing" => Some(Self::Ringing),
            "answered" | "in-progress" => Some(Self::Answered),
            "completed" => Some(Self::Completed),
            "no-answer" => Some(Self::NoAnswer),
            "busy" => Some(Self::Busy),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::NoAnswer | Self::Busy | Self::Failed
        )
    }
}

/// Outbound call placement request
#[derive(Debug, Clone)]
pub struct PlaceCallRequest {
    pub to: PhoneNumber,
    pub caller_id: String,
    pub purpose: Purpose,
    pub order_id: Option<OrderId>,
    pub language: Language,
    pub record: bool,
    pub max_duration_secs: u32,
}

#[derive(Serialize)]
struct PlaceCallBody<'a> {
    to: &'a str,
    from: &'a str,
    callback_url: String,
    stream_url: String,
    record: bool,
    max_duration_secs: u32,
    metadata: serde_json::Value,
}

#[derive(Deserialize)]
struct CallCreated {
    call_id: String,
}

pub struct TelephonyClient {
    http: reqwest::Client,
    config: TelephonyConfig,
    signer: WebhookSigner,
}

impl TelephonyClient {
    pub fn new(config: TelephonyConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .build()
            .map_err(|e| TelephonyError::Transport(e.to_string()))?;
        let signer = WebhookSigner::new(config.hmac_secret.clone().into_bytes());
        Ok(Self {
            http,
            config,
            signer,
        })
    }

    pub fn signer(&self) -> &WebhookSigner {
        &self.signer
    }

    /// Callback URL for provider webhooks, carrying a signature token so
    /// the deployment can be verified independently of the body HMAC.
    fn signed_callback_url(&self, path: &str) -> String {
        let url = format!("{}{path}", self.config.callback_base);
        let token = self.signer.sign(url.as_bytes());
        format!("{url}?token={}", urlencode(&token))
    }

    /// Place an outbound call. Returns the provider call id.
    ///
    /// Transport failures retry up to 3 attempts with 0.5s * 2^n backoff;
    /// provider rejections are returned immediately.
    pub async fn place_call(&self, req: &PlaceCallRequest) -> Result<CallId> {
        let url = format!(
            "{}/v1/accounts/{}/calls",
            self.config.api_base, self.config.account_id
        );
        let body = PlaceCallBody {
            to: req.to.as_str(),
            from: &req.caller_id,
            callback_url: self.signed_callback_url("/telephony/call-status"),
            stream_url: self.signed_callback_url("/telephony/stream"),
            record: req.record,
            max_duration_secs: req.max_duration_secs,
            metadata: serde_json::json!({
                "purpose": req.purpose.as_str(),
                "orderId": req.order_id.as_ref().map(|o| o.as_str()),
                "language": req.language.code(),
            }),
        };

        let mut last_err = None;
        for attempt in 0..PLACE_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1));
                tokio::time::sleep(backoff).await;
            }
            match self
                .http
                .post(&url)
                .basic_auth(&self.config.api_key, Some(&self.config.auth_token))
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    let created: CallCreated = resp
                        .json()
                        .await
                        .map_err(|e| TelephonyError::Transport(e.to_string()))?;
                    info!(
                        call_id = %created.call_id,
                        to = %req.to,
                        purpose = %req.purpose,
                        "Outbound call placed"
                    );
                    return Ok(CallId::new(created.call_id));
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(TelephonyError::Rejected { status, body });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Call placement transport failure");
                    last_err = Some(TelephonyError::Transport(e.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TelephonyError::Transport("no attempts made".into())))
    }

    /// Ask the provider to hang up a live call.
    pub async fn hangup(&self, call_id: &CallId) -> Result<()> {
        let url = format!(
            "{}/v1/accounts/{}/calls/{}/hangup",
            self.config.api_base, self.config.account_id, call_id
        );
        self.post_command(&url, serde_json::json!({})).await
    }

    /// Blind-transfer a live call to another phone.
    pub async fn transfer(&self, call_id: &CallId, to: &PhoneNumber) -> Result<()> {
        let url = format!(
            "{}/v1/accounts/{}/calls/{}/transfer",
            self.config.api_base, self.config.account_id, call_id
        );
        self.post_command(&url, serde_json::json!({ "to": to.as_str() }))
            .await
    }

    /// Fetch a completed recording, bounded in size and time.
    pub async fn fetch_recording(&self, url: &str, max_bytes: usize) -> Result<Bytes> {
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.config.api_key, Some(&self.config.auth_token))
            .send()
            .await
            .map_err(|e| TelephonyError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TelephonyError::Rejected {
                status: resp.status().as_u16(),
                body: "recording fetch failed".to_string(),
            });
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| TelephonyError::Transport(e.to_string()))?;
        if body.len() > max_bytes {
            return Err(TelephonyError::Rejected {
                status: 413,
                body: format!("recording exceeds {max_bytes} bytes"),
            });
        }
        Ok(body)
    }

    async fn post_command(&self, url: &str, body: serde_json::Value) -> Result<()> {
        let resp = self
            .http
            .post(url)
            .basic_auth(&self.config.api_key, Some(&self.config.auth_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| TelephonyError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TelephonyError::Rejected {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TelephonyConfig {
        TelephonyConfig {
            api_base: "http://localhost:9".to_string(),
            account_id: "AC-1".to_string(),
            api_key: "key".to_string(),
            auth_token: "token".to_string(),
            callback_base: "https://comms.example.in".to_string(),
            hmac_secret: "secret".to_string(),
        }
    }

    #[test]
    fn validate_rejects_missing_credentials() {
        let mut cfg = config();
        cfg.api_key = String::new();
        assert!(matches!(
            cfg.validate(),
            Err(TelephonyError::MissingCredentials(_))
        ));
        assert!(config().validate().is_ok());
    }

    #[test]
    fn status_parse_handles_provider_spellings() {
        assert_eq!(CallStatus::parse("no-answer"), Some(CallStatus::NoAnswer));
        assert_eq!(CallStatus::parse("in-progress"), Some(CallStatus::Answered));
        assert_eq!(CallStatus::parse("ringing"), Some(CallStatus::Ringing));
        assert_eq!(CallStatus::parse("teleported"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(CallStatus::Completed.is_terminal());
        assert!(CallStatus::NoAnswer.is_terminal());
        assert!(CallStatus::Busy.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Answered.is_terminal());
    }

    #[test]
    fn callback_url_carries_signature_token() {
        let client = TelephonyClient::new(config()).unwrap();
        let url = client.signed_callback_url("/telephony/call-status");
        assert!(url.starts_with("https://comms.example.in/telephony/call-status?token="));
    }
}
