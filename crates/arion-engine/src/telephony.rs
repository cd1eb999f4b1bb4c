//! Telephony seam
//!
//! The engine drives the telephony server through this trait so session
//! and flow logic can be exercised against an in-process fake. The only
//! production implementation delegates to [`arion_ari::AriClient`].

use std::collections::HashMap;

use async_trait::async_trait;

use arion_ari::{AriClient, PlayTarget, Result};

/// The telephony operations the engine needs.
#[async_trait]
pub trait Telephony: Send + Sync {
    async fn answer(&self, channel_id: &str) -> Result<()>;

    async fn hangup(&self, channel_id: &str) -> Result<()>;

    /// Originate a channel with a caller-chosen id.
    async fn originate(
        &self,
        endpoint: &str,
        caller_id: &str,
        app_args: &str,
        channel_vars: &HashMap<String, String>,
        timeout_secs: u32,
        channel_id: &str,
    ) -> Result<String>;

    async fn create_bridge(&self) -> Result<String>;

    async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()>;

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<()>;

    async fn play(&self, target: &PlayTarget, media_ref: &str) -> Result<String>;

    async fn record(
        &self,
        channel_id: &str,
        name: &str,
        max_duration_secs: u32,
        max_silence_secs: u32,
    ) -> Result<String>;

    async fn stop_recording(&self, name: &str) -> Result<()>;

    async fn get_channel_var(&self, channel_id: &str, name: &str) -> Result<String>;
}

#[async_trait]
impl Telephony for AriClient {
    async fn answer(&self, channel_id: &str) -> Result<()> {
        AriClient::answer(self, channel_id).await
    }

    async fn hangup(&self, channel_id: &str) -> Result<()> {
        AriClient::hangup(self, channel_id).await
    }

    async fn originate(
        &self,
        endpoint: &str,
        caller_id: &str,
        app_args: &str,
        channel_vars: &HashMap<String, String>,
        timeout_secs: u32,
        channel_id: &str,
    ) -> Result<String> {
        AriClient::originate(
            self,
            endpoint,
            caller_id,
            app_args,
            channel_vars,
            timeout_secs,
            Some(channel_id),
        )
        .await
    }

    async fn create_bridge(&self) -> Result<String> {
        AriClient::create_bridge(self).await
    }

    async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        AriClient::add_channel_to_bridge(self, bridge_id, channel_id).await
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<()> {
        AriClient::destroy_bridge(self, bridge_id).await
    }

    async fn play(&self, target: &PlayTarget, media_ref: &str) -> Result<String> {
        AriClient::play(self, target, media_ref).await
    }

    async fn record(
        &self,
        channel_id: &str,
        name: &str,
        max_duration_secs: u32,
        max_silence_secs: u32,
    ) -> Result<String> {
        AriClient::record(self, channel_id, name, max_duration_secs, max_silence_secs).await
    }

    async fn stop_recording(&self, name: &str) -> Result<()> {
        AriClient::stop_recording(self, name).await
    }

    async fn get_channel_var(&self, channel_id: &str, name: &str) -> Result<String> {
        AriClient::get_channel_var(self, channel_id, name).await
    }
}
