//! Outbound dialer
//!
//! Sequential at the decide-what-to-originate layer, parallel at the
//! in-flight-call layer. One cycle: honour the pause switch, top up the
//! contact queue from the panel (or the static list), pick the
//! least-loaded permissible line, respect the global origination throttle,
//! originate. Pausing never cancels in-flight calls.

mod pause;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::panel::Contact;

pub use pause::{PauseReason, PauseState};

/// Sleep applied while every line is excluded; the inbound-priority
/// yield point.
const LINE_YIELD: Duration = Duration::from_millis(100);

pub struct Dialer {
    engine: Arc<Engine>,
    contacts: Mutex<VecDeque<Contact>>,
    /// Global origination spacing across all lines.
    last_origination: Mutex<Option<Instant>>,
    static_seeded: AtomicBool,
}

impl Dialer {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            contacts: Mutex::new(VecDeque::new()),
            last_origination: Mutex::new(None),
            static_seeded: AtomicBool::new(false),
        })
    }

    /// Manual pause; in-flight calls complete normally.
    pub fn pause(&self) {
        self.engine.pause.pause(PauseReason::Manual);
    }

    /// Explicit resume after a manual, cascade or quota pause.
    pub fn resume(&self) {
        self.engine.pause.resume();
    }

    /// Run the dial loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("dialer started");
        loop {
            if shutdown.is_cancelled() {
                info!("dialer stopping");
                return;
            }

            if self.engine.pause.is_paused() {
                debug!(reason = ?self.engine.pause.active_reason(), "dialer paused, sleeping");
                if self.engine.pause.active_reason() == Some(PauseReason::PanelDisallow) {
                    // Keep polling so the panel can let us dial again;
                    // latched pauses wait for an explicit resume instead.
                    self.refresh_panel().await;
                }
                if !self.sleep(self.retry_interval(), &shutdown).await {
                    return;
                }
                continue;
            }

            let Some(contact) = self.next_contact(&shutdown).await else {
                if shutdown.is_cancelled() {
                    return;
                }
                if !self.sleep(self.retry_interval(), &shutdown).await {
                    return;
                }
                continue;
            };

            let Some((scenario, scenario_panel_id)) = self.engine.scenarios.next_outbound() else {
                warn!("no scenario available for outbound rotation");
                self.contacts.lock().push_front(contact);
                if !self.sleep(self.retry_interval(), &shutdown).await {
                    return;
                }
                continue;
            };

            let Some(line) = self.acquire_line(&shutdown).await else {
                // Shutdown or pause hit while yielding for a line.
                self.contacts.lock().push_front(contact);
                continue;
            };

            match self
                .engine
                .clone()
                .start_outbound(line, contact, scenario, scenario_panel_id)
                .await
            {
                Ok(session_id) => {
                    debug!(session = %session_id, "origination dispatched");
                }
                Err(e) => {
                    // The failed attempt already went through cleanup and
                    // the cascade counter.
                    warn!(error = %e, "origination attempt failed");
                }
            }
        }
    }

    fn retry_interval(&self) -> Duration {
        self.engine.config.dialer.default_retry
    }

    /// Sleep unless shutdown fires first. Returns false on shutdown.
    async fn sleep(&self, duration: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    /// Poll the panel while paused by it, refreshing the allowed flag and
    /// queueing any contacts that arrive with the go-ahead.
    async fn refresh_panel(&self) {
        if !self.engine.panel.enabled() {
            return;
        }
        match self
            .engine
            .panel
            .next_batch(self.engine.config.dialer.batch_size)
            .await
        {
            Ok(Some(batch)) => {
                self.engine.apply_batch(&batch);
                if batch.call_allowed {
                    self.contacts.lock().extend(batch.contacts.into_iter());
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "panel poll failed while paused"),
        }
    }

    /// Pop the next contact, fetching a batch when the queue runs dry.
    async fn next_contact(&self, shutdown: &CancellationToken) -> Option<Contact> {
        if let Some(contact) = self.contacts.lock().pop_front() {
            return Some(contact);
        }
        if shutdown.is_cancelled() {
            return None;
        }

        if !self.engine.panel.enabled() {
            // Static-contact operation: one pass over the configured list.
            if self.static_seeded.swap(true, Ordering::SeqCst) {
                return None;
            }
            let mut queue = self.contacts.lock();
            for (index, number) in self.engine.config.dialer.static_contacts.iter().enumerate() {
                queue.push_back(Contact {
                    // Synthetic ids; never reported as panel number ids.
                    id: -(index as i64) - 1,
                    phone_number: number.clone(),
                    metadata: None,
                });
            }
            info!(count = queue.len(), "static contacts loaded");
            return queue.pop_front();
        }

        let batch = match self
            .engine
            .panel
            .next_batch(self.engine.config.dialer.batch_size)
            .await
        {
            Ok(Some(batch)) => batch,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "batch fetch failed");
                return None;
            }
        };

        self.engine.apply_batch(&batch);
        if !batch.call_allowed {
            info!("panel disallows calling; holding origination");
            return None;
        }
        let mut queue = self.contacts.lock();
        queue.extend(batch.contacts.into_iter());
        debug!(queued = queue.len(), "batch applied");
        queue.pop_front()
    }

    /// Wait for the global throttle and a permissible line. Gives up on
    /// shutdown or when a pause cause appears.
    async fn acquire_line(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<Arc<crate::lines::Line>> {
        loop {
            if shutdown.is_cancelled() || self.engine.pause.is_paused() {
                return None;
            }
            if let Some(wait) = self.throttle_wait() {
                if !self.sleep(wait, shutdown).await {
                    return None;
                }
                continue;
            }
            match self.engine.lines.select_for_outbound(Instant::now()) {
                Some(line) => {
                    *self.last_origination.lock() = Some(Instant::now());
                    return Some(line);
                }
                None => {
                    if !self.sleep(LINE_YIELD, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Remaining global spacing before the next origination may go out.
    fn throttle_wait(&self) -> Option<Duration> {
        let spacing = Duration::from_secs_f64(
            1.0 / self.engine.config.limits.max_originations_per_second as f64,
        );
        let last = *self.last_origination.lock();
        match last {
            Some(last) => {
                let elapsed = last.elapsed();
                (elapsed < spacing).then(|| spacing - elapsed)
            }
            None => None,
        }
    }
}
