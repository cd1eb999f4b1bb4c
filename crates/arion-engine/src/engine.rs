//! The call engine
//!
//! [`Engine`] owns every shared subsystem: the session table with its id
//! correlation maps, the line and agent registries, the scenario book and
//! the external-service adapters. Event handling, flow execution and
//! cleanup are implemented in their own modules as `impl Engine` blocks;
//! the dialer drives the engine from outside through `Arc<Engine>`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use arion_ari::AriEvent;

use crate::agents::AgentRosters;
use crate::alert::Alerter;
use crate::calllog::OutcomeLogs;
use crate::config::Config;
use crate::dialer::{PauseReason, PauseState};
use crate::error::Result;
use crate::lines::LineRegistry;
use crate::panel::{Batch, Panel};
use crate::scenario::ScenarioBook;
use crate::session::{SessionHandle, SessionId};
use crate::speech::{IntentClassifier, SpeechToText};
use crate::telephony::Telephony;

/// Snapshot of engine-wide counters for logs and introspection.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub active_sessions: usize,
    pub available_inbound_agents: usize,
    pub available_outbound_agents: usize,
    pub paused: bool,
}

/// Central orchestrator of sessions, lines, agents and scenarios.
pub struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) telephony: Arc<dyn Telephony>,
    pub(crate) stt: Arc<dyn SpeechToText>,
    pub(crate) llm: Arc<dyn IntentClassifier>,
    pub(crate) panel: Arc<dyn Panel>,
    pub(crate) alerter: Arc<dyn Alerter>,
    pub(crate) scenarios: Arc<ScenarioBook>,
    pub(crate) lines: Arc<LineRegistry>,
    pub(crate) agents: Arc<AgentRosters>,
    pub(crate) outcome_logs: Arc<OutcomeLogs>,
    pub(crate) pause: Arc<PauseState>,

    /// Session table. Inserts/removes take the map shard lock only;
    /// session state itself lives behind each handle's mutex.
    pub(crate) sessions: DashMap<SessionId, Arc<SessionHandle>>,
    pub(crate) by_channel: DashMap<String, SessionId>,
    pub(crate) by_bridge: DashMap<String, SessionId>,
    pub(crate) by_playback: DashMap<String, SessionId>,
    pub(crate) by_recording: DashMap<String, SessionId>,

    /// Consecutive failed outbound attempts feeding the cascade pause.
    cascade_failures: AtomicU32,

    pub(crate) shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        config: Config,
        telephony: Arc<dyn Telephony>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn IntentClassifier>,
        panel: Arc<dyn Panel>,
        alerter: Arc<dyn Alerter>,
        scenarios: ScenarioBook,
    ) -> Arc<Self> {
        let lines = Arc::new(LineRegistry::new(
            &config.dialer.outbound_numbers,
            config.limits.clone(),
        ));
        let agents = AgentRosters::default();
        agents.inbound.seed_static(&config.operator.mobile_numbers);
        agents.outbound.seed_static(&config.operator.mobile_numbers);
        let outcome_logs = Arc::new(OutcomeLogs::new(config.call_log_dir.clone()));

        Arc::new(Self {
            config: Arc::new(config),
            telephony,
            stt,
            llm,
            panel,
            alerter,
            scenarios: Arc::new(scenarios),
            lines,
            agents: Arc::new(agents),
            outcome_logs,
            pause: Arc::new(PauseState::default()),
            sessions: DashMap::new(),
            by_channel: DashMap::new(),
            by_bridge: DashMap::new(),
            by_playback: DashMap::new(),
            by_recording: DashMap::new(),
            cascade_failures: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pause_state(&self) -> Arc<PauseState> {
        self.pause.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register scenarios and lines with the panel at startup.
    pub async fn register_with_panel(&self) -> Result<()> {
        self.panel
            .register_scenarios(&self.scenarios.registration_list())
            .await?;
        let lines: Vec<(String, String)> = self
            .lines
            .lines()
            .iter()
            .map(|line| (line.phone_number.clone(), line.display_name.clone()))
            .collect();
        self.panel.register_lines(&lines).await?;
        Ok(())
    }

    /// Fold a panel batch into the registries and the pause switch.
    pub fn apply_batch(&self, batch: &Batch) {
        self.pause.set_panel_allowed(batch.call_allowed);
        self.scenarios.set_active(
            batch
                .active_scenarios
                .iter()
                .map(|s| (s.id, s.name.clone()))
                .collect(),
        );
        self.lines.update_panel_ids(
            &batch
                .outbound_lines
                .iter()
                .map(|l| (l.id, l.phone_number.clone()))
                .collect::<Vec<_>>(),
        );
        self.agents.inbound.replace(
            batch
                .inbound_agents
                .iter()
                .map(|a| (Some(a.id), a.phone_number.clone()))
                .collect(),
        );
        self.agents.outbound.replace(
            batch
                .outbound_agents
                .iter()
                .map(|a| (Some(a.id), a.phone_number.clone()))
                .collect(),
        );
    }

    /// Consume the decoded event stream until it closes or shutdown fires.
    ///
    /// Hook bodies that touch external services are spawned; this loop
    /// itself only mutates in-memory state, so one slow session can never
    /// stall another's events.
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<AriEvent>) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.shutdown.cancelled() => {
                    info!("event loop stopping");
                    return;
                }
            };
            let Some(event) = event else {
                warn!("event channel closed");
                return;
            };
            if let Err(e) = self.clone().on_event(event).await {
                // Hook failures are contained; the consumer never dies.
                error!(error = %e, "event handling failed");
            }
        }
    }

    /// Promote an external-service quota refusal to a process-wide pause.
    pub(crate) async fn trip_quota_pause(&self, detail: &str) {
        self.pause.pause(PauseReason::Quota);
        self.alerter
            .send(&format!("arion paused: external service quota exhausted ({detail})"))
            .await;
        self.panel.set_call_allowed(false).await;
    }

    /// Feed the consecutive-failure cascade with a finished outbound
    /// attempt. Reaching the threshold pauses the dialer until an
    /// explicit resume, alerts the admins and flips the panel flag.
    pub(crate) async fn note_call_outcome(
        &self,
        direction: crate::lines::Direction,
        result: &crate::results::ResultCode,
    ) {
        use crate::results::ResultCode::*;
        if direction != crate::lines::Direction::Outbound {
            return;
        }
        let failed = matches!(
            result,
            Missed | UserDidntAnswer | Busy | PowerOff | Banned | Failed(_)
        );
        if !failed {
            self.cascade_failures.store(0, Ordering::SeqCst);
            return;
        }
        let count = self.cascade_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let threshold = self.config.dialer.fail_alert_threshold;
        if threshold > 0 && count >= threshold {
            self.cascade_failures.store(0, Ordering::SeqCst);
            warn!(count, "consecutive-failure threshold reached");
            for snapshot in self.lines.snapshots() {
                info!(?snapshot, "line state at cascade pause");
            }
            self.pause.pause(PauseReason::Cascade);
            self.alerter
                .send(&format!(
                    "arion paused: {count} consecutive failed calls (last: {result})"
                ))
                .await;
            self.panel.set_call_allowed(false).await;
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_sessions: self.sessions.len(),
            available_inbound_agents: self.agents.inbound.available_count(),
            available_outbound_agents: self.agents.outbound.available_count(),
            paused: self.pause.is_paused(),
        }
    }

    /// Orderly shutdown: cancel every live session (their flows hang up
    /// and clean up), then flush queued panel reports best-effort.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        info!(sessions = handles.len(), "cancelling active sessions");
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            self.cleanup_session(&handle, None).await;
        }
        self.panel.flush().await;
    }
}
