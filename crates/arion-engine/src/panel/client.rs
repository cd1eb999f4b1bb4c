//! Campaign panel RPC client
//!
//! Four RPCs over JSON/HTTPS with bearer auth. Panel trouble never aborts
//! a call: registration failures are startup errors, batch failures make
//! the dialer sleep and retry, and report failures land in a bounded
//! in-memory queue (oldest dropped on overflow) that a background task
//! drains with backoff — the delay doubles while sends keep failing and
//! resets once the queue empties.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{Batch, CallReport};
use crate::config::PanelSettings;
use crate::error::{EngineError, Result};

const RETRY_QUEUE_CAP: usize = 1000;
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(20);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Campaign panel contract.
#[async_trait]
pub trait Panel: Send + Sync {
    /// False when no panel is configured (static-contact operation).
    fn enabled(&self) -> bool;

    async fn register_scenarios(&self, scenarios: &[(String, String)]) -> Result<()>;

    async fn register_lines(&self, lines: &[(String, String)]) -> Result<()>;

    /// Fetch the next batch; `None` when the panel is disabled.
    async fn next_batch(&self, size: u32) -> Result<Option<Batch>>;

    /// Report one call result. Implementations queue on failure rather
    /// than propagate; a duplicate report attempt must not error.
    async fn report(&self, report: CallReport);

    /// Tell the panel whether we are accepting work (used by the
    /// failure-cascade pause). Best-effort.
    async fn set_call_allowed(&self, allowed: bool);

    /// Push queued reports out, best-effort. Called on shutdown.
    async fn flush(&self);
}

/// The real HTTP panel.
pub struct HttpPanel {
    settings: PanelSettings,
    http: reqwest::Client,
    queue: Mutex<VecDeque<CallReport>>,
}

impl HttpPanel {
    pub fn new(settings: PanelSettings) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| EngineError::Panel(format!("building HTTP client: {e}")))?;
        Ok(Arc::new(Self {
            settings,
            http,
            queue: Mutex::new(VecDeque::new()),
        }))
    }

    fn url(&self, path: &str) -> Option<String> {
        self.settings
            .base_url
            .as_ref()
            .map(|base| format!("{}/{path}", base.trim_end_matches('/')))
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = self
            .url(path)
            .ok_or_else(|| EngineError::Panel("panel disabled".into()))?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Panel(format!("{path}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Panel(format!("{path}: {status} {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Panel(format!("{path}: decoding response: {e}")))
    }

    fn enqueue(&self, report: CallReport) {
        let mut queue = self.queue.lock();
        if queue.len() >= RETRY_QUEUE_CAP {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    phone = %dropped.phone_number,
                    status = dropped.status.as_str(),
                    "report retry queue full, dropping oldest"
                );
            }
        }
        queue.push_back(report);
    }

    async fn try_send(&self, report: &CallReport) -> Result<()> {
        self.post("reports", serde_json::to_value(report).unwrap_or_default())
            .await?;
        Ok(())
    }

    /// Background drain loop for queued reports. Consecutive failed
    /// drains stretch the delay; an emptied queue resets it.
    pub async fn run_retry_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(retry_delay(failures)) => {}
                _ = shutdown.cancelled() => return,
            }
            if self.drain_once().await {
                failures = 0;
            } else {
                failures = failures.saturating_add(1);
            }
        }
    }

    /// Send queued reports oldest-first until the queue is empty or a
    /// send fails. Returns whether the queue was emptied.
    async fn drain_once(&self) -> bool {
        loop {
            let next = self.queue.lock().front().cloned();
            let Some(report) = next else { return true };
            match self.try_send(&report).await {
                Ok(()) => {
                    self.queue.lock().pop_front();
                    debug!(phone = %report.phone_number, "queued report delivered");
                }
                Err(e) => {
                    debug!(error = %e, queued = self.queue.lock().len(), "panel still unreachable");
                    return false;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl Panel for HttpPanel {
    fn enabled(&self) -> bool {
        self.settings.base_url.is_some()
    }

    async fn register_scenarios(&self, scenarios: &[(String, String)]) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let body = json!({
            "company": self.settings.company,
            "scenarios": scenarios
                .iter()
                .map(|(name, display_name)| json!({"name": name, "display_name": display_name}))
                .collect::<Vec<_>>(),
        });
        self.post("scenarios/register", body).await?;
        info!(count = scenarios.len(), "scenarios registered with panel");
        Ok(())
    }

    async fn register_lines(&self, lines: &[(String, String)]) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let body = json!({
            "company": self.settings.company,
            "lines": lines
                .iter()
                .map(|(phone_number, display_name)| {
                    json!({"phone_number": phone_number, "display_name": display_name})
                })
                .collect::<Vec<_>>(),
        });
        self.post("lines/register", body).await?;
        info!(count = lines.len(), "outbound lines registered with panel");
        Ok(())
    }

    async fn next_batch(&self, size: u32) -> Result<Option<Batch>> {
        if !self.enabled() {
            return Ok(None);
        }
        let body = json!({"company": self.settings.company, "size": size});
        let response = self.post("contacts/next", body).await?;
        let batch: Batch = serde_json::from_value(response)
            .map_err(|e| EngineError::Panel(format!("decoding batch: {e}")))?;
        Ok(Some(batch))
    }

    async fn report(&self, report: CallReport) {
        if !self.enabled() {
            return;
        }
        if let Err(e) = self.try_send(&report).await {
            warn!(
                phone = %report.phone_number,
                status = report.status.as_str(),
                error = %e,
                "report failed, queueing for retry"
            );
            self.enqueue(report);
        }
    }

    async fn set_call_allowed(&self, allowed: bool) {
        if !self.enabled() {
            return;
        }
        let body = json!({"company": self.settings.company, "call_allowed": allowed});
        if let Err(e) = self.post("call-allowed", body).await {
            warn!(allowed, error = %e, "could not update panel call_allowed");
        }
    }

    async fn flush(&self) {
        let _ = self.drain_once().await;
        let left = self.queue.lock().len();
        if left > 0 {
            warn!(left, "undelivered reports remain at shutdown");
        }
    }
}

/// Delay before the next drain attempt: doubles per consecutive failure,
/// capped, in the manner of the event stream's reconnect backoff.
fn retry_delay(failures: u32) -> Duration {
    let exp = failures.min(4);
    (RETRY_BACKOFF_INITIAL * 2u32.pow(exp)).min(RETRY_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::PanelStatus;

    fn report(n: u32) -> CallReport {
        CallReport {
            company: "acme".into(),
            number_id: Some(n as i64),
            phone_number: format!("0912000{n:04}"),
            status: PanelStatus::Missed,
            reason: "missed".into(),
            attempted_at: "2026-08-01T10:00:00".into(),
            scenario_id: None,
            outbound_line_id: None,
            agent_id: None,
            agent_phone: None,
            user_message: None,
        }
    }

    fn unreachable_panel() -> Arc<HttpPanel> {
        HttpPanel::new(PanelSettings {
            base_url: Some("http://192.0.2.1:1".into()),
            api_token: "t".into(),
            company: "acme".into(),
            timeout: Duration::from_millis(100),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn failed_reports_are_queued() {
        let panel = unreachable_panel();
        panel.report(report(1)).await;
        panel.report(report(2)).await;
        assert_eq!(panel.queued(), 2);
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let panel = unreachable_panel();
        for n in 0..(RETRY_QUEUE_CAP as u32 + 3) {
            panel.enqueue(report(n));
        }
        assert_eq!(panel.queued(), RETRY_QUEUE_CAP);
        let front = panel.queue.lock().front().cloned().unwrap();
        assert_eq!(front.number_id, Some(3));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_secs(20));
        assert_eq!(retry_delay(1), Duration::from_secs(40));
        assert_eq!(retry_delay(2), Duration::from_secs(80));
        assert_eq!(retry_delay(4), Duration::from_secs(300));
        assert_eq!(retry_delay(40), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn drain_reports_whether_queue_emptied() {
        let panel = unreachable_panel();
        assert!(panel.drain_once().await, "empty queue drains trivially");
        panel.enqueue(report(1));
        assert!(!panel.drain_once().await, "unreachable panel cannot drain");
        assert_eq!(panel.queued(), 1);
    }

    #[tokio::test]
    async fn disabled_panel_is_inert() {
        let panel = HttpPanel::new(PanelSettings::default()).unwrap();
        assert!(!panel.enabled());
        assert!(panel.next_batch(10).await.unwrap().is_none());
        panel.report(report(1)).await;
        assert_eq!(panel.queued(), 0);
    }
}
