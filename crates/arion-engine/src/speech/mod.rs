//! Speech adapters: transcription and intent classification
//!
//! Both services sit behind traits so the flow engine can be exercised
//! with in-process fakes. The real adapters cap their parallelism with
//! semaphores and translate the services' inconsistent refusal signals
//! into one [`SpeechError`] vocabulary.

mod enhance;
mod llm;
mod stt;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use enhance::{AudioStats, Enhancer};
pub use llm::{LlmClient, LlmConfig};
pub use stt::{SttClient, SttConfig};

/// Which external speech service produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechService {
    Stt,
    Llm,
}

#[derive(Debug, Error)]
pub enum SpeechError {
    /// The service refuses further work until credited. Promoted by the
    /// caller to a dialer pause; never absorbed per-call.
    #[error("{service:?} quota exhausted: {detail}")]
    QuotaExhausted {
        service: SpeechService,
        detail: String,
    },

    /// The recording carries no usable speech (silent, too short, or the
    /// service's own empty-audio sentinel). Treated as a caller hangup.
    #[error("Empty audio")]
    EmptyAudio,

    /// Network-level or 5xx failure; the attempt may be retried.
    #[error("Transient speech error: {0}")]
    Transient(String),

    /// The service answered something we cannot use.
    #[error("Malformed speech response: {0}")]
    Malformed(String),

    /// Local preprocessing failed (ffmpeg, unreadable file).
    #[error("Audio preprocessing failed: {0}")]
    Preprocess(String),
}

pub type SpeechResult<T> = std::result::Result<T, SpeechError>;

/// Transcription service contract.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a recording, applying the scenario's hotwords.
    async fn transcribe(&self, recording: &Path, hotwords: &[String]) -> SpeechResult<String>;
}

/// Intent classification contract.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Classify a transcript with the scenario's prompt template
    /// (`{transcript}` is substituted before the call).
    async fn classify(&self, template: &str, transcript: &str) -> SpeechResult<String>;
}
