//! Admin alerting contract
//!
//! The engine raises an alert when the dialer trips its failure cascade or
//! an external service reports exhausted quota. Delivery is behind the
//! [`Alerter`] trait; the SMS gateway implementation is intentionally
//! minimal and alerts are fire-and-forget — a failed alert is logged, never
//! propagated into call handling.

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::config::SmsSettings;

/// Something that can notify the configured admins.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, message: &str);
}

/// SMS-gateway alerter. One HTTP call per configured admin number.
pub struct SmsAlerter {
    settings: SmsSettings,
    endpoint: String,
    http: reqwest::Client,
}

impl SmsAlerter {
    pub fn new(settings: SmsSettings, endpoint: String) -> Self {
        Self {
            settings,
            endpoint,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Alerter for SmsAlerter {
    async fn send(&self, message: &str) {
        if self.settings.admins.is_empty() || self.settings.api_key.is_empty() {
            warn!("alert requested but SMS settings are incomplete: {message}");
            return;
        }
        for admin in &self.settings.admins {
            let body = json!({
                "from": self.settings.from,
                "to": admin,
                "text": message,
            });
            let result = self
                .http
                .post(&self.endpoint)
                .header("apikey", &self.settings.api_key)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    info!(admin = %admin, "alert SMS sent");
                }
                Ok(resp) => {
                    warn!(admin = %admin, status = %resp.status(), "alert SMS rejected");
                }
                Err(e) => {
                    warn!(admin = %admin, error = %e, "alert SMS failed");
                }
            }
        }
    }
}

/// Logs alerts instead of delivering them. Used in tests and when no SMS
/// gateway is configured.
#[derive(Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, message: &str) {
        warn!("ALERT: {message}");
    }
}
