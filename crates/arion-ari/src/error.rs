//! Error types for ARI operations

use thiserror::Error;

/// Errors produced by the ARI REST adapter and the event stream.
///
/// REST failures are categorized so callers can decide on retry policy;
/// the adapter itself never retries anything beyond the connection pool's
/// own connect handling.
#[derive(Debug, Error)]
pub enum AriError {
    /// Connection-level failure (refused, reset, DNS) or request deadline hit.
    /// Usually recoverable with a retry at the caller's discretion.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The referenced resource (channel, bridge, playback, recording) does
    /// not exist on the telephony server (HTTP 404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current resource state (HTTP 409),
    /// e.g. recording a channel that is already being recorded.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The server refused the request (4xx other than 404/409).
    #[error("Rejected by telephony server: {0}")]
    Rejected(String),

    /// Server-side failure (5xx).
    #[error("Telephony server error: {0}")]
    Server(String),

    /// The response body could not be decoded into the expected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The event stream subscription failed or was closed.
    #[error("Event stream error: {0}")]
    Stream(String),
}

impl AriError {
    /// Whether a caller-side retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AriError::TransientNetwork(_) | AriError::Server(_))
    }
}

pub type Result<T> = std::result::Result<T, AriError>;
