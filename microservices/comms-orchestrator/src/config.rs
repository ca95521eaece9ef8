//! Service configuration
//!
//! Telephony credentials, the Core Backend credential and the HMAC secret
//! are fatal when missing: the process refuses to start rather than serve
//! partial functionality.

use std::collections::HashMap;
use std::time::Duration;

use dastak_core::config::{env_or, env_parse, required_env};
use dastak_core::{CommsError, Language, PartyKind, PhoneNumber, Result};
use dastak_telephony_sdk::TelephonyConfig;

#[derive(Debug, Clone)]
pub struct CommsConfig {
    pub http_bind: String,

    pub telephony: TelephonyConfig,
    /// Outbound caller ids, per target kind, with a default
    pub caller_ids: CallerIds,
    /// Human operator line for transfers and alerts
    pub operator_phone: PhoneNumber,

    pub backend_url: String,
    pub backend_token: String,
    pub admin_token: String,
    /// External durable queue endpoint; unset means log-and-count (dev)
    pub queue_endpoint: Option<String>,

    pub asr_priority: Vec<String>,
    pub tts_priority: Vec<String>,
    pub providers: ProviderCredentials,

    pub default_language: Language,
    pub default_voice: String,

    pub max_sessions: usize,
    pub session_idle: Duration,
    pub sweep_interval: Duration,
    pub audio_cache_bytes: usize,
    /// Language-model endpoint for open-ended conversations
    pub llm_url: String,
    pub llm_api_key: String,
}

#[derive(Debug, Clone)]
pub struct CallerIds {
    default: String,
    by_target: HashMap<PartyKind, String>,
}

impl CallerIds {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            by_target: HashMap::new(),
        }
    }

    pub fn for_target(&self, target: PartyKind) -> &str {
        self.by_target
            .get(&target)
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub local_asr_url: Option<String>,
    pub local_tts_url: Option<String>,
    pub deepgram_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub azure_api_key: Option<String>,
    pub azure_region: String,
}

impl CommsConfig {
    pub fn from_env() -> Result<Self> {
        let telephony = TelephonyConfig {
            api_base: env_or("TELEPHONY_API_BASE", "https://api.telephony.example"),
            account_id: required_env("TELEPHONY_ACCOUNT_ID")?,
            api_key: required_env("TELEPHONY_API_KEY")?,
            auth_token: required_env("TELEPHONY_AUTH_TOKEN")?,
            callback_base: required_env("CALLBACK_BASE_URL")?,
            hmac_secret: required_env("TELEPHONY_HMAC_SECRET")?,
        };

        let mut by_target = HashMap::new();
        for (kind, key) in [
            (PartyKind::Vendor, "CALLER_ID_VENDOR"),
            (PartyKind::Rider, "CALLER_ID_RIDER"),
            (PartyKind::Customer, "CALLER_ID_CUSTOMER"),
        ] {
            if let Ok(v) = std::env::var(key) {
                by_target.insert(kind, v);
            }
        }

        let default_language = env_or("DEFAULT_LANGUAGE", "hi-IN")
            .parse::<Language>()
            .map_err(|e| CommsError::Config(format!("DEFAULT_LANGUAGE: {e}")))?;

        Ok(Self {
            http_bind: env_or("HTTP_BIND", "0.0.0.0:8080"),
            telephony,
            caller_ids: CallerIds {
                default: required_env("CALLER_ID_DEFAULT")?,
                by_target,
            },
            operator_phone: PhoneNumber::normalize(&env_or("OPERATOR_PHONE", "+911244567890")),
            backend_url: required_env("CORE_BACKEND_URL")?,
            backend_token: required_env("CORE_BACKEND_TOKEN")?,
            admin_token: required_env("ADMIN_BEARER_TOKEN")?,
            queue_endpoint: std::env::var("OUTBOUND_QUEUE_URL").ok(),
            asr_priority: parse_priority(&env_or("ASR_PRIORITY", "local,deepgram,google,azure")),
            tts_priority: parse_priority(&env_or(
                "TTS_PRIORITY",
                "local,elevenlabs,deepgram,google,azure",
            )),
            providers: ProviderCredentials {
                local_asr_url: std::env::var("LOCAL_ASR_URL").ok(),
                local_tts_url: std::env::var("LOCAL_TTS_URL").ok(),
                deepgram_api_key: std::env::var("DEEPGRAM_API_KEY").ok(),
                elevenlabs_api_key: std::env::var("ELEVENLABS_API_KEY").ok(),
                google_api_key: std::env::var("GOOGLE_SPEECH_API_KEY").ok(),
                azure_api_key: std::env::var("AZURE_SPEECH_API_KEY").ok(),
                azure_region: env_or("AZURE_SPEECH_REGION", "centralindia"),
            },
            default_language,
            default_voice: env_or("DEFAULT_VOICE", "standard-female"),
            max_sessions: env_parse("MAX_SESSIONS", 10_000),
            session_idle: Duration::from_secs(env_parse("SESSION_IDLE_SECS", 30 * 60)),
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS", 60)),
            audio_cache_bytes: env_parse("AUDIO_CACHE_BYTES", 256 * 1024 * 1024),
            llm_url: env_or("LLM_URL", "http://localhost:8090"),
            llm_api_key: env_or("LLM_API_KEY", ""),
        })
    }
}

fn parse_priority(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_list_parses_and_trims() {
        let list = parse_priority(" local, Deepgram ,google,,azure ");
        assert_eq!(list, vec!["local", "deepgram", "google", "azure"]);
    }
}
