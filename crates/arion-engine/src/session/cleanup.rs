//! Session teardown and result reporting
//!
//! Cleanup is idempotent through the session's `cleanup_done` flag and
//! safe to run from any task: the flow's terminal steps, the hangup event
//! path, the origination watchdog and shutdown all funnel here. Telephony
//! teardown is best-effort; accounting and reporting are not skipped
//! because a hangup REST call failed.

use std::sync::Arc;

use chrono::SecondsFormat;
use tracing::{debug, info, warn};

use crate::calllog::OutcomeFile;
use crate::engine::Engine;
use crate::panel::CallReport;
use crate::results::{translate, PanelStatus, ResultCode};
use crate::session::types::{Session, SessionHandle};

impl Engine {
    /// Tear a session down and emit its terminal report.
    ///
    /// `result_override` supplies a terminal result for paths that did not
    /// run a `set_result` step (watchdog, SIP causes, abandoned queued
    /// callers). A result already recorded wins over the override.
    pub(crate) async fn cleanup_session(
        &self,
        handle: &Arc<SessionHandle>,
        result_override: Option<ResultCode>,
    ) {
        let teardown = {
            let mut session = handle.state.lock().await;
            if session.cleanup_done {
                return;
            }
            session.cleanup_done = true;

            if session.result.is_none() {
                let fallback = result_override.unwrap_or_else(|| final_result_for(&session));
                session.set_result(fallback);
            }

            // Stop the flow task if it is still running.
            handle.cancel.cancel();
            handle.waiters.abort_all();

            let report = self.fresh_report(&mut session);

            if let Some((kind, agent)) = session.agent.take() {
                self.agents.roster(kind).release(&agent.phone_number);
            }

            let mut live_channels = Vec::new();
            if session.customer_leg.state.is_live() {
                live_channels.push(session.customer_leg.channel_id.clone());
            }
            if let Some(operator) = &session.operator_leg {
                if operator.state.is_live() {
                    live_channels.push(operator.channel_id.clone());
                }
            }

            Teardown {
                live_channels,
                all_channels: {
                    let mut ids = vec![session.customer_leg.channel_id.clone()];
                    if let Some(op) = &session.operator_leg {
                        ids.push(op.channel_id.clone());
                    }
                    ids
                },
                bridge_id: session.bridge_id.take(),
                line: session.line.clone(),
                line_counted: std::mem::take(&mut session.line_counted),
                direction: session.direction,
                report,
                result: session.result.clone(),
                customer_number: session.customer_number.clone(),
            }
        };

        for channel_id in &teardown.live_channels {
            if let Err(e) = self.telephony.hangup(channel_id).await {
                debug!(channel = %channel_id, error = %e, "hangup during cleanup failed");
            }
        }
        if let Some(bridge_id) = &teardown.bridge_id {
            if let Err(e) = self.telephony.destroy_bridge(bridge_id).await {
                debug!(bridge = %bridge_id, error = %e, "bridge teardown failed");
            }
            self.by_bridge.remove(bridge_id);
        }
        for channel_id in &teardown.all_channels {
            self.by_channel.remove(channel_id);
        }
        self.by_playback.retain(|_, v| *v != handle.id);
        self.by_recording.retain(|_, v| *v != handle.id);

        if teardown.line_counted {
            teardown.line.end_call(teardown.direction);
            self.lines.count_global(teardown.direction, -1);
        }

        if let Some(ResultCode::Hangup) = teardown.result {
            self.outcome_logs.append(
                OutcomeFile::Hangups,
                &teardown.customer_number,
                "caller hung up",
            );
        }

        if let Some(report) = teardown.report {
            self.panel.report(report).await;
        }
        if let Some(result) = &teardown.result {
            self.note_call_outcome(teardown.direction, result).await;
        }

        self.sessions.remove(&handle.id);
        info!(
            session = %handle.id,
            result = teardown.result.map(|r| r.to_string()).unwrap_or_default(),
            "session cleaned up"
        );
    }

    /// Report the current result if its mapped status was not already
    /// reported for this session. Used at every `set_result` transition
    /// and once more at cleanup.
    pub(crate) async fn report_transition(&self, handle: &Arc<SessionHandle>) {
        let report = {
            let mut session = handle.state.lock().await;
            self.fresh_report(&mut session)
        };
        if let Some(report) = report {
            self.panel.report(report).await;
        }
    }

    /// Build a report for the session's current result unless that mapped
    /// status has been reported before. Mutates the de-dup set.
    fn fresh_report(&self, session: &mut Session) -> Option<CallReport> {
        let code = session.result.clone()?;
        let status = translate(&code);
        if !session.reported.insert(status) {
            debug!(session = %session.id, status = status.as_str(), "duplicate report suppressed");
            return None;
        }
        Some(build_report(&self.config.panel.company, session, code, status))
    }
}

struct Teardown {
    live_channels: Vec<String>,
    all_channels: Vec<String>,
    bridge_id: Option<String>,
    line: Arc<crate::lines::Line>,
    line_counted: bool,
    direction: crate::lines::Direction,
    report: Option<CallReport>,
    result: Option<ResultCode>,
    customer_number: String,
}

/// Terminal result for sessions that never ran a `set_result` step.
fn final_result_for(session: &Session) -> ResultCode {
    if session.answered() {
        ResultCode::Hangup
    } else if let Some(cause) = session.pending_cause {
        ResultCode::from_sip_cause(cause)
    } else {
        ResultCode::Missed
    }
}

fn build_report(
    company: &str,
    session: &Session,
    code: ResultCode,
    status: PanelStatus,
) -> CallReport {
    let user_message = if code.attaches_transcript() {
        session.transcript.clone()
    } else {
        None
    };
    let (agent_id, agent_phone) = match &session.agent {
        Some((_, agent)) => (agent.id, Some(agent.phone_number.clone())),
        None => (None, None),
    };
    CallReport {
        company: company.to_string(),
        number_id: session.contact_id,
        phone_number: session.customer_number.clone(),
        status,
        reason: code.to_string(),
        attempted_at: session
            .customer_leg
            .start_ts
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        scenario_id: session.scenario_panel_id,
        outbound_line_id: session.line.panel_id(),
        agent_id,
        agent_phone,
        user_message,
    }
}
