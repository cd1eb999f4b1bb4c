//! Session correlation and event dispatch
//!
//! The engine is the sole mutator of the session table. Events resolve to
//! a session through the channel/bridge/playback/recording maps, state is
//! updated under the session mutex, and waiting flow steps are woken
//! through the session's signal table. Anything that needs a REST call is
//! spawned so the event loop never blocks on external I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use arion_ari::{Channel, LiveRecording, Playback};

use crate::calllog::OutcomeFile;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::lines::{Direction, Line};
use crate::numbers;
use crate::panel::Contact;
use crate::results::ResultCode;
use crate::scenario::Scenario;
use crate::session::signals::{WaitKey, WaitOutcome};
use crate::session::types::{Leg, LegState, Session, SessionHandle, SessionId};

impl Engine {
    pub(crate) async fn on_event(self: Arc<Self>, event: arion_ari::AriEvent) -> Result<()> {
        use arion_ari::AriEvent::*;
        match event {
            StasisStart { channel, args } => self.on_stasis_start(channel, args).await,
            ChannelStateChange { channel } => self.on_state_change(channel).await,
            ChannelHangupRequest { channel, cause } | ChannelDestroyed { channel, cause } => {
                self.on_channel_gone(channel, cause).await
            }
            StasisEnd { .. } | PlaybackStarted { .. } => Ok(()),
            PlaybackFinished { playback } => self.on_playback_finished(playback),
            RecordingFinished { recording } => self.on_recording_event(recording, None),
            RecordingFailed { recording } => {
                let cause = recording.cause.clone().unwrap_or_else(|| "failed".into());
                self.on_recording_event(recording, Some(cause))
            }
            Dial {
                peer,
                dialstatus,
                cause,
            } => self.on_dial(peer, dialstatus, cause).await,
            Unknown { kind } => {
                debug!(kind, "unhandled event kind");
                Ok(())
            }
        }
    }

    fn session_by_channel(&self, channel_id: &str) -> Option<Arc<SessionHandle>> {
        let id = self.by_channel.get(channel_id)?.value().clone();
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    async fn on_stasis_start(self: Arc<Self>, channel: Channel, args: Vec<String>) -> Result<()> {
        if let Some(handle) = self.session_by_channel(&channel.id) {
            // A leg we originated reached the application; treat it like a
            // state report.
            self.apply_channel_state(&handle, &channel).await;
            return Ok(());
        }
        if matches!(
            args.first().map(String::as_str),
            Some("outbound") | Some("operator")
        ) {
            // A leg we originated, but the session is already gone (late
            // event after cleanup); nothing to attach to.
            debug!(channel = %channel.id, "stasis start for unknown originated leg");
            return Ok(());
        }
        let engine = self;
        tokio::spawn(async move {
            if let Err(e) = engine.start_inbound(channel).await {
                warn!(error = %e, "inbound call setup failed");
            }
        });
        Ok(())
    }

    async fn on_state_change(self: Arc<Self>, channel: Channel) -> Result<()> {
        let Some(handle) = self.session_by_channel(&channel.id) else {
            return Ok(());
        };
        self.apply_channel_state(&handle, &channel).await;
        Ok(())
    }

    /// Fold a reported channel state into the owning session.
    async fn apply_channel_state(self: Arc<Self>, handle: &Arc<SessionHandle>, channel: &Channel) {
        let Some(new_state) = LegState::from_channel_state(&channel.state) else {
            return;
        };
        let mut start_flow = false;
        {
            let mut session = handle.state.lock().await;
            if channel.id == session.customer_leg.channel_id {
                if session.customer_leg.state.is_live() {
                    session.customer_leg.state = new_state;
                }
                if new_state == LegState::Answered && !session.flow_started {
                    session.flow_started = true;
                    session.timing.answered_at = Some(chrono::Local::now());
                    start_flow = true;
                }
            } else if let Some(operator) = session.operator_leg.as_mut() {
                if operator.channel_id == channel.id {
                    if operator.state.is_live() {
                        operator.state = new_state;
                    }
                    if new_state == LegState::Answered {
                        handle
                            .waiters
                            .complete(WaitKey::Answer(channel.id.clone()), WaitOutcome::Answered);
                    }
                }
            }
        }
        if start_flow {
            self.on_customer_answered(handle.clone()).await;
        }
    }

    /// The customer leg answered: join it to the bridge and start the
    /// scenario task.
    async fn on_customer_answered(self: Arc<Self>, handle: Arc<SessionHandle>) {
        let engine = self;
        tokio::spawn(async move {
            let (bridge_id, channel_id, direction) = {
                let session = handle.state.lock().await;
                (
                    session.bridge_id.clone(),
                    session.customer_leg.channel_id.clone(),
                    session.direction,
                )
            };
            if let Some(bridge_id) = bridge_id {
                if let Err(e) = engine
                    .telephony
                    .add_channel_to_bridge(&bridge_id, &channel_id)
                    .await
                {
                    warn!(error = %e, "could not bridge customer leg");
                }
            }
            info!(session = %handle.id, ?direction, "customer answered, starting flow");
            engine.run_flow(handle).await;
        });
    }

    async fn on_channel_gone(self: Arc<Self>, channel: Channel, cause: Option<u32>) -> Result<()> {
        let Some(handle) = self.session_by_channel(&channel.id) else {
            return Ok(());
        };
        let customer_gone = {
            let mut session = handle.state.lock().await;
            if channel.id == session.customer_leg.channel_id {
                session.customer_leg.state = LegState::Hungup;
                if session.pending_cause.is_none() {
                    session.pending_cause = cause;
                }
                true
            } else {
                if let Some(operator) = session.operator_leg.as_mut() {
                    if operator.channel_id == channel.id {
                        operator.state = LegState::Hungup;
                        handle
                            .waiters
                            .complete(WaitKey::Answer(channel.id.clone()), WaitOutcome::Hungup);
                    }
                }
                false
            }
        };
        self.by_channel.remove(&channel.id);
        if customer_gone {
            // The customer is gone: abort any suspended step, cancel the
            // flow task and clean up off the event loop.
            handle.waiters.abort_all();
            handle.cancel.cancel();
            let engine = self;
            tokio::spawn(async move {
                engine.cleanup_session(&handle, None).await;
            });
        }
        Ok(())
    }

    fn on_playback_finished(&self, playback: Playback) -> Result<()> {
        let handle = self
            .by_playback
            .get(playback.id.as_str())
            .map(|e| e.value().clone())
            .or_else(|| playback_target_session(self, &playback))
            .and_then(|id| self.sessions.get(&id).map(|e| e.value().clone()));
        let Some(handle) = handle else {
            debug!(playback = %playback.id, "playback finished for no session");
            return Ok(());
        };
        self.by_playback.remove(&playback.id);
        handle
            .waiters
            .complete(WaitKey::Playback(playback.id), WaitOutcome::PlaybackDone);
        Ok(())
    }

    fn on_recording_event(&self, recording: LiveRecording, failure: Option<String>) -> Result<()> {
        let Some(session_id) = self.by_recording.get(recording.name.as_str()).map(|e| e.value().clone())
        else {
            debug!(recording = %recording.name, "recording event for no session");
            return Ok(());
        };
        let Some(handle) = self.sessions.get(&session_id).map(|e| e.value().clone()) else {
            return Ok(());
        };
        self.by_recording.remove(&recording.name);
        let outcome = match failure {
            None => WaitOutcome::RecordingDone,
            Some(cause) => WaitOutcome::RecordingFailed(cause),
        };
        handle
            .waiters
            .complete(WaitKey::Recording(recording.name), outcome);
        Ok(())
    }

    async fn on_dial(
        &self,
        peer: Channel,
        dialstatus: String,
        cause: Option<u32>,
    ) -> Result<()> {
        let Some(handle) = self.session_by_channel(&peer.id) else {
            return Ok(());
        };
        let cause = cause.or_else(|| cause_from_dialstatus(&dialstatus));
        if let Some(cause) = cause {
            let mut session = handle.state.lock().await;
            if session.pending_cause.is_none() && !session.answered() {
                debug!(session = %handle.id, cause, %dialstatus, "pre-answer dial diagnostics");
                session.pending_cause = Some(cause);
            }
        }
        Ok(())
    }

    /// Accept an inbound call: match it to a line, queue behind capacity
    /// if needed, answer, and let the answer event start the inbound flow.
    pub(crate) async fn start_inbound(self: Arc<Self>, channel: Channel) -> Result<()> {
        if !self.lines.admit_global_inbound() {
            warn!(channel = %channel.id, "inbound rejected: global inbound cap");
            let _ = self.telephony.hangup(&channel.id).await;
            return Ok(());
        }
        let Some(scenario) = self.scenarios.next_inbound() else {
            warn!(channel = %channel.id, "inbound rejected: no inbound scenario loaded");
            let _ = self.telephony.hangup(&channel.id).await;
            return Ok(());
        };

        let caller = numbers::normalize(&channel.caller.number);
        let line = self.lines.match_did(&channel.dialplan.exten);
        if line.unmapped {
            info!(exten = %channel.dialplan.exten, "inbound DID matches no line, using unmapped");
        }

        let session = Session {
            id: SessionId::new(),
            direction: Direction::Inbound,
            scenario,
            scenario_panel_id: None,
            line: line.clone(),
            contact_id: None,
            customer_number: caller.clone(),
            customer_leg: Leg::new(channel.id.clone(), caller, channel.caller.name.clone()),
            operator_leg: None,
            agent: None,
            bridge_id: None,
            cursor: String::new(),
            counters: HashMap::new(),
            transcript: None,
            intent: None,
            result: None,
            reported: Default::default(),
            pending_cause: None,
            recording_seq: 0,
            timing: Default::default(),
            flow_started: false,
            line_counted: false,
            cleanup_done: false,
        };
        let session_id = session.id.clone();
        let handle = SessionHandle::new(session);
        self.sessions.insert(session_id.clone(), handle.clone());
        self.by_channel.insert(channel.id.clone(), session_id.clone());

        // Inbound priority: wait FIFO for a slot while the line is
        // saturated. Dropping the waiter (abandon paths) is safe: the
        // wake-up skips closed receivers.
        let mut queued_logged = false;
        loop {
            if line.try_begin_inbound(self.lines.limits(), Instant::now()) {
                break;
            }
            let waiter = line.enqueue_inbound();
            // A slot may have freed between the check and the enqueue;
            // claiming it now just leaves a dead waiter behind.
            if line.try_begin_inbound(self.lines.limits(), Instant::now()) {
                break;
            }
            if !queued_logged {
                info!(session = %session_id, line = %line.phone_number, "inbound queued for a slot");
                queued_logged = true;
            }
            tokio::select! {
                granted = waiter => {
                    if granted.is_err() {
                        self.abandon_queued_inbound(&handle).await;
                        return Ok(());
                    }
                }
                _ = handle.cancel.cancelled() => {
                    self.abandon_queued_inbound(&handle).await;
                    return Ok(());
                }
            }
        }
        self.lines.count_global(Direction::Inbound, 1);
        {
            let mut session = handle.state.lock().await;
            session.line_counted = true;
        }

        let bridge_id = self.telephony.create_bridge().await?;
        self.by_bridge.insert(bridge_id.clone(), session_id.clone());
        {
            let mut session = handle.state.lock().await;
            session.bridge_id = Some(bridge_id);
        }

        if let Err(e) = self.telephony.answer(&channel.id).await {
            warn!(error = %e, "could not answer inbound channel");
            self.cleanup_session(&handle, Some(ResultCode::Missed)).await;
            return Err(EngineError::Telephony(e));
        }

        // A channel that entered the application already answered emits no
        // further state change; start the flow ourselves.
        let start_now = {
            let mut session = handle.state.lock().await;
            if channel.state == "Up" && !session.flow_started {
                session.flow_started = true;
                session.timing.answered_at = Some(chrono::Local::now());
                true
            } else {
                false
            }
        };
        if start_now {
            self.on_customer_answered(handle).await;
        }
        Ok(())
    }

    async fn abandon_queued_inbound(&self, handle: &Arc<SessionHandle>) {
        let number = {
            let session = handle.state.lock().await;
            session.customer_number.clone()
        };
        self.outcome_logs
            .append(OutcomeFile::UserDrop, &number, "abandoned while queued");
        self.cleanup_session(handle, Some(ResultCode::Hangup)).await;
    }

    /// Create an outbound session and originate its customer leg. Called
    /// by the dialer after line selection and throttling.
    pub(crate) async fn start_outbound(
        self: Arc<Self>,
        line: Arc<Line>,
        contact: Contact,
        scenario: Arc<Scenario>,
        scenario_panel_id: Option<i64>,
    ) -> Result<SessionId> {
        let number = numbers::normalize(&contact.phone_number);
        let channel_id = format!("arion-{}", uuid::Uuid::new_v4());
        let caller_id = if line.phone_number.is_empty() {
            self.config.dialer.default_caller_id.clone()
        } else {
            line.phone_number.clone()
        };

        let session = Session {
            id: SessionId::new(),
            direction: Direction::Outbound,
            scenario,
            scenario_panel_id,
            line: line.clone(),
            // Static contacts carry synthetic negative ids; those never
            // go back to the panel.
            contact_id: (contact.id >= 0).then_some(contact.id),
            customer_number: number.clone(),
            customer_leg: Leg::new(channel_id.clone(), number.clone(), caller_id.clone()),
            operator_leg: None,
            agent: None,
            bridge_id: None,
            cursor: String::new(),
            counters: HashMap::new(),
            transcript: None,
            intent: None,
            result: None,
            reported: Default::default(),
            pending_cause: None,
            recording_seq: 0,
            timing: Default::default(),
            flow_started: false,
            line_counted: true,
            cleanup_done: false,
        };
        let session_id = session.id.clone();
        let handle = SessionHandle::new(session);

        // Index before any REST call so no event about this channel can
        // miss the session.
        self.sessions.insert(session_id.clone(), handle.clone());
        self.by_channel.insert(channel_id.clone(), session_id.clone());
        line.begin_outbound(Instant::now());
        self.lines.count_global(Direction::Outbound, 1);

        let bridge_id = match self.telephony.create_bridge().await {
            Ok(id) => id,
            Err(e) => {
                self.rollback_outbound(&handle, &channel_id).await;
                return Err(e.into());
            }
        };
        self.by_bridge.insert(bridge_id.clone(), session_id.clone());
        {
            let mut session = handle.state.lock().await;
            session.bridge_id = Some(bridge_id);
        }

        let dial_string = format!("{}{}", numbers::last4(&line.phone_number), number);
        let endpoint = format!("PJSIP/{dial_string}@{}", self.config.dialer.outbound_trunk);
        let mut channel_vars = HashMap::new();
        channel_vars.insert("ARION_SESSION".to_string(), session_id.to_string());

        if let Err(e) = self
            .telephony
            .originate(
                &endpoint,
                &caller_id,
                "outbound",
                &channel_vars,
                self.config.dialer.origination_timeout.as_secs() as u32,
                &channel_id,
            )
            .await
        {
            warn!(error = %e, contact = %number, "origination failed");
            self.rollback_outbound(&handle, &channel_id).await;
            return Err(e.into());
        }

        info!(session = %session_id, contact = %number, line = %line.phone_number, "originated");
        self.spawn_origination_watchdog(handle);
        Ok(session_id)
    }

    /// Undo a partially created outbound session whose origination never
    /// went out.
    async fn rollback_outbound(&self, handle: &Arc<SessionHandle>, channel_id: &str) {
        self.by_channel.remove(channel_id);
        self.cleanup_session(handle, Some(ResultCode::Missed)).await;
    }

    /// Declare the attempt missed if no event answers it in time.
    fn spawn_origination_watchdog(self: Arc<Self>, handle: Arc<SessionHandle>) {
        let timeout = self.config.dialer.origination_timeout + std::time::Duration::from_secs(5);
        let engine = self;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = handle.cancel.cancelled() => return,
            }
            let expired = {
                let session = handle.state.lock().await;
                !session.cleanup_done && !session.answered() && session.result.is_none()
            };
            if expired {
                info!(session = %handle.id, "origination timed out");
                handle.cancel.cancel();
                engine.cleanup_session(&handle, Some(ResultCode::Missed)).await;
            }
        });
    }
}

fn playback_target_session(engine: &Engine, playback: &Playback) -> Option<SessionId> {
    let target = playback.target_uri.as_str();
    if let Some(bridge_id) = target.strip_prefix("bridge:") {
        return engine.by_bridge.get(bridge_id).map(|e| e.value().clone());
    }
    if let Some(channel_id) = target.strip_prefix("channel:") {
        return engine.by_channel.get(channel_id).map(|e| e.value().clone());
    }
    None
}

/// Map a textual dial disposition to the SIP cause used by the result
/// translator, when the event did not carry a numeric cause.
fn cause_from_dialstatus(dialstatus: &str) -> Option<u32> {
    match dialstatus {
        "BUSY" => Some(17),
        "CHANUNAVAIL" => Some(18),
        "CONGESTION" => Some(34),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialstatus_mapping() {
        assert_eq!(cause_from_dialstatus("BUSY"), Some(17));
        assert_eq!(cause_from_dialstatus("CHANUNAVAIL"), Some(18));
        assert_eq!(cause_from_dialstatus("CONGESTION"), Some(34));
        assert_eq!(cause_from_dialstatus("NOANSWER"), None);
    }
}
