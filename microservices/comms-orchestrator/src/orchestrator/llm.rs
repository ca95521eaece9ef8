//! Language-model endpoint client
//!
//! Free-form intent resolution is delegated to an external language
//! model; this client sends the caller's utterance plus the recent
//! conversation turns and gets a reply to speak back.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use dastak_core::{CommsError, Language, Result};

use crate::session::{ConversationTurn, TurnRole};

#[derive(Serialize)]
struct ConverseRequest<'a> {
    query: &'a str,
    language: &'a str,
    history: Vec<HistoryTurn<'a>>,
}

#[derive(Serialize)]
struct HistoryTurn<'a> {
    role: &'static str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ConverseResponse {
    reply: String,
}

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LlmClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CommsError::Internal(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    /// One conversational turn: the utterance plus recent history in,
    /// reply text out.
    pub async fn reply(
        &self,
        query: &str,
        history: &[ConversationTurn],
        language: Language,
    ) -> Result<String> {
        let request = ConverseRequest {
            query,
            language: language.code(),
            history: history
                .iter()
                .map(|turn| HistoryTurn {
                    role: match turn.role {
                        TurnRole::Caller => "user",
                        TurnRole::System => "assistant",
                    },
                    text: &turn.text,
                })
                .collect(),
        };

        debug!(turns = history.len(), "Sending conversation turn to language model");

        let resp = self
            .http
            .post(format!("{}/v1/converse", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(CommsError::Upstream(format!(
                "language model returned {}",
                resp.status()
            )));
        }
        let body: ConverseResponse = resp
            .json()
            .await
            .map_err(|e| CommsError::Upstream(format!("bad language model body: {e}")))?;
        Ok(body.reply)
    }
}
