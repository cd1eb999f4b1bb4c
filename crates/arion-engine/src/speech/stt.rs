//! Transcription service adapter
//!
//! Pipeline: ffmpeg enhancement → silence gate → multipart upload →
//! transcript extraction. The service is inconsistent about refusals, so
//! quota detection is a union of three signals: HTTP 403, a known
//! balance-exhausted phrase in the body, or the "Empty Audio file"
//! sentinel (which instead means the caller said nothing).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::enhance::Enhancer;
use super::{SpeechError, SpeechResult, SpeechService, SpeechToText};

/// Body phrases that mean the account is out of balance.
const BALANCE_PHRASES: &[&str] = &[
    "not enough balance",
    "insufficient balance",
    "balance is not enough",
];

/// Transcript text the service returns for audio it considers empty.
const EMPTY_AUDIO_SENTINEL: &str = "Empty Audio file";

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub base_url: String,
    pub gateway_token: String,
    pub timeout: Duration,
    pub max_parallel: usize,
}

/// HTTP adapter for the transcription service.
pub struct SttClient {
    config: SttConfig,
    http: reqwest::Client,
    enhancer: Enhancer,
    permits: Arc<Semaphore>,
}

impl SttClient {
    pub fn new(config: SttConfig, enhancer: Enhancer) -> SpeechResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SpeechError::Transient(format!("building HTTP client: {e}")))?;
        let permits = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Ok(Self {
            config,
            http,
            enhancer,
            permits,
        })
    }

    async fn upload(&self, enhanced: &Path, hotwords: &[String]) -> SpeechResult<String> {
        let audio = tokio::fs::read(enhanced)
            .await
            .map_err(|e| SpeechError::Preprocess(format!("read {}: {e}", enhanced.display())))?;
        let file_name = enhanced
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        let mut form = multipart::Form::new()
            .part(
                "audio",
                multipart::Part::bytes(audio)
                    .file_name(file_name)
                    .mime_str("audio/wav")
                    .map_err(|e| SpeechError::Malformed(format!("audio part: {e}")))?,
            )
            .text("model", "default")
            .text("srt", "false")
            .text("inverseNormalizer", "false")
            .text("timestamp", "false")
            .text("spokenPunctuation", "false")
            .text("punctuation", "false")
            .text("numSpeakers", "0")
            .text("diarize", "false");
        for hotword in hotwords {
            form = form.text("hotwords[]", hotword.clone());
        }

        let response = self
            .http
            .post(&self.config.base_url)
            .header("gateway-token", &self.config.gateway_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SpeechError::Transient(format!("transcription request: {e}")))?;

        let status = response.status();
        let body: Value = if status == reqwest::StatusCode::FORBIDDEN {
            Value::Null
        } else {
            response
                .json()
                .await
                .map_err(|e| SpeechError::Malformed(format!("transcription body: {e}")))?
        };

        if let Some(refusal) = detect_refusal(status.as_u16(), &body) {
            return Err(refusal);
        }
        if !status.is_success() {
            let err = format!("transcription status {status}");
            return Err(if status.is_server_error() {
                SpeechError::Transient(err)
            } else {
                SpeechError::Malformed(err)
            });
        }

        let transcript = extract_transcript(&body);
        if transcript == EMPTY_AUDIO_SENTINEL {
            return Err(SpeechError::EmptyAudio);
        }
        Ok(transcript)
    }
}

#[async_trait]
impl SpeechToText for SttClient {
    async fn transcribe(&self, recording: &Path, hotwords: &[String]) -> SpeechResult<String> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SpeechError::Transient("STT semaphore closed".into()))?;

        let enhanced = self.enhancer.enhance(recording).await?;
        let stats = Enhancer::inspect(&enhanced)?;
        if stats.is_silent() {
            debug!(recording = %recording.display(), ?stats, "silence gate hit, skipping service");
            return Err(SpeechError::EmptyAudio);
        }

        let transcript = self.upload(&enhanced, hotwords).await?;
        drop(permit);
        info!(recording = %recording.display(), chars = transcript.len(), "transcription done");
        Ok(transcript)
    }
}

/// Pull the transcript out of the service's shifting response shapes:
/// `data.text`, then `data.data.text`, then
/// `data.data.aiResponse.result.text`, else empty.
pub(crate) fn extract_transcript(body: &Value) -> String {
    let paths: [&[&str]; 3] = [
        &["data", "text"],
        &["data", "data", "text"],
        &["data", "data", "aiResponse", "result", "text"],
    ];
    for path in paths {
        let mut cursor = body;
        let mut found = true;
        for key in path {
            match cursor.get(key) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(text) = cursor.as_str() {
                return text.trim().to_string();
            }
        }
    }
    String::new()
}

/// The quota/empty-audio union check. 403 and balance phrases mean
/// exhausted credit; the empty-audio sentinel means the caller said
/// nothing and must not be treated as a service failure.
pub(crate) fn detect_refusal(status: u16, body: &Value) -> Option<SpeechError> {
    if status == 403 {
        return Some(SpeechError::QuotaExhausted {
            service: SpeechService::Stt,
            detail: "HTTP 403".into(),
        });
    }
    let flattened = body.to_string().to_lowercase();
    for phrase in BALANCE_PHRASES {
        if flattened.contains(phrase) {
            return Some(SpeechError::QuotaExhausted {
                service: SpeechService::Stt,
                detail: (*phrase).into(),
            });
        }
    }
    if extract_transcript(body) == EMPTY_AUDIO_SENTINEL {
        return Some(SpeechError::EmptyAudio);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_top_level_text() {
        let body = json!({"data": {"text": " بله حتما "}});
        assert_eq!(extract_transcript(&body), "بله حتما");
    }

    #[test]
    fn falls_through_to_nested_shapes() {
        let body = json!({"data": {"data": {"text": "نه"}}});
        assert_eq!(extract_transcript(&body), "نه");
        let body = json!({"data": {"data": {"aiResponse": {"result": {"text": "باشه"}}}}});
        assert_eq!(extract_transcript(&body), "باشه");
    }

    #[test]
    fn unknown_shape_yields_empty() {
        assert_eq!(extract_transcript(&json!({"foo": 1})), "");
    }

    #[test]
    fn http_403_is_quota() {
        match detect_refusal(403, &Value::Null) {
            Some(SpeechError::QuotaExhausted { service, .. }) => {
                assert_eq!(service, SpeechService::Stt)
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn balance_phrase_is_quota() {
        let body = json!({"message": "Not enough balance for this request"});
        assert!(matches!(
            detect_refusal(200, &body),
            Some(SpeechError::QuotaExhausted { .. })
        ));
    }

    #[test]
    fn empty_audio_sentinel_is_not_quota() {
        let body = json!({"data": {"text": "Empty Audio file"}});
        assert!(matches!(
            detect_refusal(200, &body),
            Some(SpeechError::EmptyAudio)
        ));
    }

    #[test]
    fn clean_response_passes() {
        let body = json!({"data": {"text": "سلام"}});
        assert!(detect_refusal(200, &body).is_none());
    }
}
