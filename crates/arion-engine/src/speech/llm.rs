//! Intent classification adapter
//!
//! One chat-completion call per classification against an OpenAI-compatible
//! endpoint. The answer is the first choice's content, lower-cased and
//! trimmed; the flow engine validates it against the scenario's intent set
//! and falls back to token matching on anything but a quota refusal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::debug;

use super::{IntentClassifier, SpeechError, SpeechResult, SpeechService};

/// Body phrases that mean the account is out of credit.
const QUOTA_PHRASES: &[&str] = &["insufficient_quota", "quota exceeded", "billing hard limit"];

const TEMPERATURE: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of the chat-completions API, without the path suffix.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_parallel: usize,
}

/// HTTP adapter for the classification model.
pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> SpeechResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SpeechError::Transient(format!("building HTTP client: {e}")))?;
        let permits = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Ok(Self {
            config,
            http,
            permits,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl IntentClassifier for LlmClient {
    async fn classify(&self, template: &str, transcript: &str) -> SpeechResult<String> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SpeechError::Transient("LLM semaphore closed".into()))?;

        let prompt = template.replace("{transcript}", transcript);
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": TEMPERATURE,
        });

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Transient(format!("classification request: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(SpeechError::QuotaExhausted {
                service: SpeechService::Llm,
                detail: "HTTP 403".into(),
            });
        }
        let raw = response
            .text()
            .await
            .map_err(|e| SpeechError::Transient(format!("classification body: {e}")))?;

        let lowered = raw.to_lowercase();
        for phrase in QUOTA_PHRASES {
            if lowered.contains(phrase) {
                return Err(SpeechError::QuotaExhausted {
                    service: SpeechService::Llm,
                    detail: (*phrase).into(),
                });
            }
        }
        if status.is_server_error() {
            return Err(SpeechError::Transient(format!("classification status {status}")));
        }
        if !status.is_success() {
            return Err(SpeechError::Malformed(format!("classification status {status}")));
        }

        let body: Value = serde_json::from_str(&raw)
            .map_err(|e| SpeechError::Malformed(format!("classification JSON: {e}")))?;
        let answer = extract_answer(&body)
            .ok_or_else(|| SpeechError::Malformed("no choices in response".into()))?;
        debug!(answer = %answer, "intent classified");
        Ok(answer)
    }
}

pub(crate) fn extract_answer(body: &Value) -> Option<String> {
    let content = body
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?;
    Some(content.trim().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_and_normalizes_first_choice() {
        let body = json!({
            "choices": [
                {"message": {"role": "assistant", "content": "  YES \n"}},
                {"message": {"role": "assistant", "content": "no"}}
            ]
        });
        assert_eq!(extract_answer(&body).unwrap(), "yes");
    }

    #[test]
    fn missing_choices_is_none() {
        assert!(extract_answer(&json!({"object": "error"})).is_none());
    }
}
