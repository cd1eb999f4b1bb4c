//! Typed REST client for the telephony server's control interface
//!
//! One [`AriClient`] is shared by the whole engine; it owns a bounded
//! connection pool and applies a per-call deadline. Every operation maps
//! HTTP failures into the [`AriError`] categories; retry policy belongs to
//! the caller, not to this adapter.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{AriError, Result};

/// Connection settings for the REST interface.
#[derive(Debug, Clone)]
pub struct AriConfig {
    /// Base URL of the REST interface, e.g. `http://pbx:8088/ari`.
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Stasis application name channels are subscribed to.
    pub app_name: String,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Upper bound on pooled connections to the telephony host.
    pub max_connections: usize,
}

impl Default for AriConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088/ari".into(),
            username: "asterisk".into(),
            password: "asterisk".into(),
            app_name: "arion".into(),
            timeout: Duration::from_secs(10),
            max_connections: 32,
        }
    }
}

/// Where to direct a playback.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayTarget {
    Channel(String),
    Bridge(String),
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BridgeBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PlaybackBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RecordingBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VariableBody {
    value: String,
}

/// Typed wrapper over the telephony server's HTTP operations.
#[derive(Debug, Clone)]
pub struct AriClient {
    config: AriConfig,
    http: reqwest::Client,
}

impl AriClient {
    pub fn new(config: AriConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_connections)
            .build()
            .map_err(|e| AriError::TransientNetwork(format!("building HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.config.username, Some(&self.config.password))
    }

    /// Map an HTTP response into the adapter's error categories.
    async fn check(response: Response, op: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{op}: {status} {body}");
        Err(match status {
            StatusCode::NOT_FOUND => AriError::NotFound(detail),
            StatusCode::CONFLICT => AriError::Conflict(detail),
            s if s.is_client_error() => AriError::Rejected(detail),
            _ => AriError::Server(detail),
        })
    }

    fn transport(op: &str, err: reqwest::Error) -> AriError {
        AriError::TransientNetwork(format!("{op}: {err}"))
    }

    /// Answer a ringing channel.
    pub async fn answer(&self, channel_id: &str) -> Result<()> {
        let url = self.url(&format!("channels/{channel_id}/answer"));
        let resp = self
            .authed(self.http.post(&url))
            .send()
            .await
            .map_err(|e| Self::transport("answer", e))?;
        Self::check(resp, "answer").await?;
        Ok(())
    }

    /// Hang up a channel. A 404 means the channel is already gone.
    pub async fn hangup(&self, channel_id: &str) -> Result<()> {
        let url = self.url(&format!("channels/{channel_id}"));
        let resp = self
            .authed(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| Self::transport("hangup", e))?;
        Self::check(resp, "hangup").await?;
        Ok(())
    }

    /// Originate an outbound channel into the application.
    ///
    /// Returns the new channel id. Passing `channel_id` pins the id so the
    /// caller can index the channel before any event about it can arrive.
    /// The channel surfaces on the event stream once the far end answers.
    pub async fn originate(
        &self,
        endpoint: &str,
        caller_id: &str,
        app_args: &str,
        channel_vars: &HashMap<String, String>,
        timeout_secs: u32,
        channel_id: Option<&str>,
    ) -> Result<String> {
        let url = self.url("channels");
        let mut body = json!({
            "endpoint": endpoint,
            "app": self.config.app_name,
            "appArgs": app_args,
            "callerId": caller_id,
            "timeout": timeout_secs,
            "variables": channel_vars,
        });
        if let Some(id) = channel_id {
            body["channelId"] = json!(id);
        }
        debug!(endpoint, caller_id, "originating channel");
        let resp = self
            .authed(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport("originate", e))?;
        let resp = Self::check(resp, "originate").await?;
        let channel: ChannelBody = resp
            .json()
            .await
            .map_err(|e| AriError::Malformed(format!("originate response: {e}")))?;
        Ok(channel.id)
    }

    /// Create a mixing bridge and return its id.
    pub async fn create_bridge(&self) -> Result<String> {
        let url = self.url("bridges");
        let resp = self
            .authed(self.http.post(&url))
            .json(&json!({ "type": "mixing" }))
            .send()
            .await
            .map_err(|e| Self::transport("create_bridge", e))?;
        let resp = Self::check(resp, "create_bridge").await?;
        let bridge: BridgeBody = resp
            .json()
            .await
            .map_err(|e| AriError::Malformed(format!("create_bridge response: {e}")))?;
        Ok(bridge.id)
    }

    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        let url = self.url(&format!("bridges/{bridge_id}/addChannel"));
        let resp = self
            .authed(self.http.post(&url))
            .query(&[("channel", channel_id)])
            .send()
            .await
            .map_err(|e| Self::transport("add_channel_to_bridge", e))?;
        Self::check(resp, "add_channel_to_bridge").await?;
        Ok(())
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> Result<()> {
        let url = self.url(&format!("bridges/{bridge_id}"));
        let resp = self
            .authed(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| Self::transport("destroy_bridge", e))?;
        Self::check(resp, "destroy_bridge").await?;
        Ok(())
    }

    /// Start a playback on a channel or bridge; returns the playback id
    /// to correlate with `PlaybackFinished` events.
    pub async fn play(&self, target: &PlayTarget, media_ref: &str) -> Result<String> {
        let url = match target {
            PlayTarget::Channel(id) => self.url(&format!("channels/{id}/play")),
            PlayTarget::Bridge(id) => self.url(&format!("bridges/{id}/play")),
        };
        let resp = self
            .authed(self.http.post(&url))
            .query(&[("media", media_ref)])
            .send()
            .await
            .map_err(|e| Self::transport("play", e))?;
        let resp = Self::check(resp, "play").await?;
        let playback: PlaybackBody = resp
            .json()
            .await
            .map_err(|e| AriError::Malformed(format!("play response: {e}")))?;
        Ok(playback.id)
    }

    /// Start recording a channel into a server-side wav file.
    ///
    /// Returns the recording name to correlate with `RecordingFinished`.
    pub async fn record(
        &self,
        channel_id: &str,
        name: &str,
        max_duration_secs: u32,
        max_silence_secs: u32,
    ) -> Result<String> {
        let url = self.url(&format!("channels/{channel_id}/record"));
        let resp = self
            .authed(self.http.post(&url))
            .query(&[
                ("name", name),
                ("format", "wav"),
                ("maxDurationSeconds", &max_duration_secs.to_string()),
                ("maxSilenceSeconds", &max_silence_secs.to_string()),
                ("ifExists", "overwrite"),
            ])
            .send()
            .await
            .map_err(|e| Self::transport("record", e))?;
        let resp = Self::check(resp, "record").await?;
        let recording: RecordingBody = resp
            .json()
            .await
            .map_err(|e| AriError::Malformed(format!("record response: {e}")))?;
        Ok(recording.name)
    }

    /// Stop a live recording. Used when the flow step owning it is cancelled.
    pub async fn stop_recording(&self, name: &str) -> Result<()> {
        let url = self.url(&format!("recordings/live/{name}/stop"));
        let resp = self
            .authed(self.http.post(&url))
            .send()
            .await
            .map_err(|e| Self::transport("stop_recording", e))?;
        Self::check(resp, "stop_recording").await?;
        Ok(())
    }

    /// Read a channel variable.
    pub async fn get_channel_var(&self, channel_id: &str, name: &str) -> Result<String> {
        let url = self.url(&format!("channels/{channel_id}/variable"));
        let resp = self
            .authed(self.http.get(&url))
            .query(&[("variable", name)])
            .send()
            .await
            .map_err(|e| Self::transport("get_channel_var", e))?;
        let resp = Self::check(resp, "get_channel_var").await?;
        let var: VariableBody = resp
            .json()
            .await
            .map_err(|e| AriError::Malformed(format!("get_channel_var response: {e}")))?;
        Ok(var.value)
    }
}
