//! Error types for the engine
//!
//! One error enum covers the orchestration layer. Adapter-level errors
//! (`AriError`, `SpeechError`) are wrapped rather than flattened so a
//! caller can still categorize them, which matters for retry policy and
//! for the quota-pause promotion in the dialer.

use thiserror::Error;

use crate::speech::SpeechError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scenario error: {0}")]
    Scenario(String),

    #[error("Telephony error: {0}")]
    Telephony(#[from] arion_ari::AriError),

    #[error("Speech error: {0}")]
    Speech(#[from] SpeechError),

    #[error("Panel error: {0}")]
    Panel(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    pub fn scenario(msg: impl Into<String>) -> Self {
        EngineError::Scenario(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
