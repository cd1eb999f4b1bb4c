//! Event stream consumer
//!
//! Holds the long-lived WebSocket subscription to the telephony server,
//! decodes each message into an [`AriEvent`] and forwards it over an mpsc
//! channel. On disconnect it reconnects with exponential backoff (1 s,
//! doubling, capped at 30 s); the backoff resets only after a connection
//! that actually delivered a subscription. Consecutive failures beyond
//! `max_attempts` end the consumer with an error so the process can exit
//! and be restarted by its supervisor.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AriError, Result};
use crate::events::AriEvent;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Settings for the WebSocket subscription.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint, e.g. `ws://pbx:8088/ari/events`.
    pub ws_url: String,
    pub app_name: String,
    pub username: String,
    pub password: String,
    /// Consecutive failed connection attempts tolerated before giving up.
    pub max_attempts: u32,
}

/// Long-lived event stream subscription.
pub struct EventStream {
    config: StreamConfig,
}

impl EventStream {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    fn subscribe_url(&self) -> String {
        format!(
            "{}?app={}&api_key={}:{}&subscribeAll=false",
            self.config.ws_url, self.config.app_name, self.config.username, self.config.password
        )
    }

    /// Run the consumer until `shutdown` fires or reconnection is exhausted.
    ///
    /// Decoded events are handed off through `events`; the send awaits only
    /// on channel capacity, never on downstream I/O — the session manager
    /// drains the channel without blocking on external services.
    pub async fn run(
        self,
        events: mpsc::Sender<AriEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let connected = tokio::select! {
                r = self.consume_once(&events) => r,
                _ = shutdown.cancelled() => {
                    info!("event stream shutting down");
                    return Ok(());
                }
            };

            match connected {
                Ok(delivered) => {
                    info!(delivered, "event stream connection closed");
                    if delivered > 0 {
                        attempt = 0;
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "event stream connection failed");
                }
            }

            attempt += 1;
            if self.config.max_attempts > 0 && attempt > self.config.max_attempts {
                return Err(AriError::Stream(format!(
                    "gave up after {} reconnect attempts",
                    attempt - 1
                )));
            }

            let delay = backoff_delay(attempt);
            info!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting event stream");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// One connection lifecycle. Returns how many events were delivered.
    async fn consume_once(&self, events: &mpsc::Sender<AriEvent>) -> Result<u64> {
        let url = self.subscribe_url();
        let (ws, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| AriError::Stream(format!("connect: {e}")))?;
        info!(app = %self.config.app_name, "event stream subscribed");

        let (_sink, mut stream) = ws.split();
        let mut delivered: u64 = 0;

        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| AriError::Stream(format!("read: {e}")))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => {
                    debug!(?frame, "event stream closed by server");
                    break;
                }
                other => {
                    debug!(?other, "ignoring non-text event frame");
                    continue;
                }
            };

            match AriEvent::parse(&text) {
                Ok(AriEvent::Unknown { kind }) => {
                    debug!(kind, "dropping unrecognised event");
                }
                Ok(event) => {
                    delivered += 1;
                    if events.send(event).await.is_err() {
                        // Receiver gone: the engine is shutting down.
                        return Ok(delivered);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "undecodable event dropped");
                }
            }
        }
        Ok(delivered)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(5);
    let delay = BACKOFF_INITIAL * 2u32.pow(exp);
    delay.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn subscribe_url_carries_app_and_key() {
        let stream = EventStream::new(StreamConfig {
            ws_url: "ws://pbx:8088/ari/events".into(),
            app_name: "arion".into(),
            username: "user".into(),
            password: "secret".into(),
            max_attempts: 10,
        });
        let url = stream.subscribe_url();
        assert!(url.contains("app=arion"));
        assert!(url.contains("api_key=user:secret"));
    }
}
