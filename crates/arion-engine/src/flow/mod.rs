//! Scenario flow execution
//!
//! One task per session interprets the scenario graph step by step. Steps
//! that depend on telephony outcomes park on the session's signal table
//! with a watchdog deadline; every suspension also selects on the session's
//! cancellation token, so a customer hangup unwinds the step, stops any
//! live recording, tears down a half-built operator leg and releases the
//! agent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use arion_ari::PlayTarget;

use crate::agents::AgentKind;
use crate::calllog::OutcomeFile;
use crate::engine::Engine;
use crate::results::{FailReason, ResultCode};
use crate::scenario::{Flow, Step};
use crate::session::{SessionHandle, WaitKey, WaitOutcome};
use crate::speech::{Enhancer, SpeechError, SpeechService};

/// Upper bound on a prompt playback: longest deployed prompt plus slack.
const PLAYBACK_WATCHDOG: Duration = Duration::from_secs(45);

/// Runaway guard for cyclic scenarios missing their retry limits.
const MAX_STEPS: u32 = 256;

/// How a suspended wait ended.
enum Waited {
    Outcome(WaitOutcome),
    Timeout,
    Cancelled,
}

enum StepEnd {
    Continue(String),
    Terminal,
}

impl Engine {
    /// Interpret the session's flow from its entry step to a terminal
    /// step. The caller has already joined the customer leg to the bridge.
    pub(crate) async fn run_flow(&self, handle: Arc<SessionHandle>) {
        let flow: Arc<Flow> = {
            let session = handle.state.lock().await;
            let flow = match session.direction {
                crate::lines::Direction::Outbound => Some(session.scenario.flow.clone()),
                crate::lines::Direction::Inbound => session.scenario.inbound_flow.clone(),
            };
            match flow {
                Some(flow) => Arc::new(flow),
                None => {
                    warn!(session = %handle.id, "no flow for direction, ending call");
                    drop(session);
                    self.hangup_and_cleanup(&handle).await;
                    return;
                }
            }
        };

        let mut step_id = flow.entry.clone();
        let mut steps_run = 0u32;
        loop {
            if handle.cancel.is_cancelled() {
                return;
            }
            steps_run += 1;
            if steps_run > MAX_STEPS {
                warn!(session = %handle.id, "step limit exhausted, ending call");
                self.hangup_and_cleanup(&handle).await;
                return;
            }

            let Some(step) = flow.steps.get(&step_id).cloned() else {
                warn!(session = %handle.id, step = %step_id, "missing step, ending call");
                self.hangup_and_cleanup(&handle).await;
                return;
            };
            {
                let mut session = handle.state.lock().await;
                session.cursor = step_id.clone();
            }
            debug!(session = %handle.id, step = %step_id, "executing step");

            let end = match step {
                Step::Entry { next } => StepEnd::Continue(next),
                Step::PlayPrompt {
                    prompt,
                    next,
                    on_failure,
                } => self.step_play(&handle, &prompt, next, on_failure).await,
                Step::Record {
                    next,
                    on_empty,
                    on_failure,
                } => self.step_record(&handle, next, on_empty, on_failure).await,
                Step::ClassifyIntent { next, on_failure } => {
                    self.step_classify(&handle, next, on_failure).await
                }
                Step::RouteByIntent { routes } => {
                    let intent = {
                        let session = handle.state.lock().await;
                        session.intent.clone().unwrap_or_else(|| "unknown".into())
                    };
                    match routes.get(&intent).or_else(|| routes.get("unknown")) {
                        Some(target) => StepEnd::Continue(target.clone()),
                        None => {
                            debug!(session = %handle.id, intent = %intent, "no route, hanging up");
                            self.hangup_and_cleanup(&handle).await;
                            StepEnd::Terminal
                        }
                    }
                }
                Step::SetResult { result, next } => {
                    {
                        let mut session = handle.state.lock().await;
                        info!(session = %handle.id, result = %result, "result set");
                        session.set_result(result);
                    }
                    self.report_transition(&handle).await;
                    StepEnd::Continue(next)
                }
                Step::TransferToOperator {
                    agent_type,
                    on_success,
                    on_failure,
                } => {
                    self.step_transfer(&handle, &agent_type, on_success, on_failure)
                        .await
                }
                Step::Disconnect | Step::Hangup => {
                    self.hangup_and_cleanup(&handle).await;
                    StepEnd::Terminal
                }
                Step::Wait => {
                    // Parked: the hangup event path runs cleanup.
                    handle.cancel.cancelled().await;
                    StepEnd::Terminal
                }
                Step::CheckRetryLimit {
                    counter,
                    limit,
                    over,
                    under,
                } => {
                    let mut session = handle.state.lock().await;
                    let count = session.counters.entry(counter).or_insert(0);
                    *count += 1;
                    if *count > limit {
                        StepEnd::Continue(over)
                    } else {
                        StepEnd::Continue(under)
                    }
                }
            };

            match end {
                StepEnd::Continue(next) => step_id = next,
                StepEnd::Terminal => return,
            }
        }
    }

    async fn hangup_and_cleanup(&self, handle: &Arc<SessionHandle>) {
        self.cleanup_session(handle, None).await;
    }

    /// Wait on a registered signal with a deadline, honouring cancellation.
    async fn wait(
        &self,
        handle: &SessionHandle,
        rx: tokio::sync::oneshot::Receiver<WaitOutcome>,
        deadline: Duration,
    ) -> Waited {
        tokio::select! {
            outcome = rx => match outcome {
                Ok(outcome) => Waited::Outcome(outcome),
                Err(_) => Waited::Cancelled,
            },
            _ = tokio::time::sleep(deadline) => Waited::Timeout,
            _ = handle.cancel.cancelled() => Waited::Cancelled,
        }
    }

    async fn step_play(
        &self,
        handle: &Arc<SessionHandle>,
        prompt: &str,
        next: String,
        on_failure: Option<String>,
    ) -> StepEnd {
        let failure_target = on_failure.unwrap_or_else(|| next.clone());
        let (media, bridge_id) = {
            let session = handle.state.lock().await;
            (
                session.scenario.prompt(prompt).map(str::to_string),
                session.bridge_id.clone(),
            )
        };
        let (Some(media), Some(bridge_id)) = (media, bridge_id) else {
            warn!(session = %handle.id, prompt, "prompt or bridge unavailable");
            return StepEnd::Continue(failure_target);
        };

        let playback_id = match self
            .telephony
            .play(&PlayTarget::Bridge(bridge_id), &media)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(session = %handle.id, prompt, error = %e, "playback start failed");
                return StepEnd::Continue(failure_target);
            }
        };
        self.by_playback.insert(playback_id.clone(), handle.id.clone());
        let rx = handle.waiters.register(WaitKey::Playback(playback_id.clone()));

        match self.wait(handle, rx, PLAYBACK_WATCHDOG).await {
            Waited::Outcome(WaitOutcome::PlaybackDone) => StepEnd::Continue(next),
            Waited::Outcome(_) | Waited::Cancelled => StepEnd::Terminal,
            Waited::Timeout => {
                warn!(session = %handle.id, prompt, "playback watchdog fired");
                self.by_playback.remove(&playback_id);
                handle.waiters.forget(&WaitKey::Playback(playback_id));
                StepEnd::Continue(failure_target)
            }
        }
    }

    async fn step_record(
        &self,
        handle: &Arc<SessionHandle>,
        next: String,
        on_empty: String,
        on_failure: String,
    ) -> StepEnd {
        let (channel_id, name, max_duration, max_silence) = {
            let mut session = handle.state.lock().await;
            (
                session.customer_leg.channel_id.clone(),
                session.next_recording_name(),
                session.scenario.stt.max_duration_seconds,
                session.scenario.stt.max_silence_seconds,
            )
        };

        // The name is ours, so the waiter and the index can exist before
        // the server learns about the recording.
        self.by_recording.insert(name.clone(), handle.id.clone());
        let rx = handle.waiters.register(WaitKey::Recording(name.clone()));

        if let Err(e) = self
            .telephony
            .record(&channel_id, &name, max_duration, max_silence)
            .await
        {
            warn!(session = %handle.id, error = %e, "recording start failed");
            self.by_recording.remove(&name);
            handle.waiters.forget(&WaitKey::Recording(name));
            return StepEnd::Continue(on_failure);
        }

        let deadline = Duration::from_secs((max_duration + max_silence + 10) as u64);
        match self.wait(handle, rx, deadline).await {
            Waited::Outcome(WaitOutcome::RecordingDone) => {
                let raw = self.recording_path(&name);
                match Enhancer::inspect(&raw) {
                    Ok(stats) if stats.is_silent() => {
                        debug!(session = %handle.id, ?stats, "empty reply");
                        StepEnd::Continue(on_empty)
                    }
                    Ok(_) => StepEnd::Continue(next),
                    Err(e) => {
                        warn!(session = %handle.id, error = %e, "recording unreadable");
                        StepEnd::Continue(on_failure)
                    }
                }
            }
            Waited::Outcome(WaitOutcome::RecordingFailed(cause)) => {
                warn!(session = %handle.id, cause, "recording subsystem failed");
                StepEnd::Continue(on_failure)
            }
            Waited::Outcome(_) => StepEnd::Terminal,
            Waited::Timeout => {
                warn!(session = %handle.id, recording = %name, "recording watchdog fired");
                let _ = self.telephony.stop_recording(&name).await;
                self.by_recording.remove(&name);
                StepEnd::Continue(on_failure)
            }
            Waited::Cancelled => {
                // Stop the live recording so nothing stays allocated on
                // the telephony host.
                let _ = self.telephony.stop_recording(&name).await;
                self.by_recording.remove(&name);
                StepEnd::Terminal
            }
        }
    }

    fn recording_path(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.config.speech.recordings_dir).join(format!("{name}.wav"))
    }

    async fn step_classify(
        &self,
        handle: &Arc<SessionHandle>,
        next: String,
        on_failure: String,
    ) -> StepEnd {
        let (scenario, seq, number) = {
            let session = handle.state.lock().await;
            (
                session.scenario.clone(),
                session.recording_seq,
                session.customer_number.clone(),
            )
        };
        let recording = self.recording_path(&format!("{}-{}", handle.id, seq));

        let transcript = match self.stt.transcribe(&recording, &scenario.stt.hotwords).await {
            Ok(transcript) => transcript,
            Err(SpeechError::EmptyAudio) => {
                // The caller said nothing and is usually gone already.
                info!(session = %handle.id, "empty audio, treating as hangup");
                {
                    let mut session = handle.state.lock().await;
                    session.set_result(ResultCode::Hangup);
                }
                self.hangup_and_cleanup(handle).await;
                return StepEnd::Terminal;
            }
            Err(SpeechError::QuotaExhausted { service, detail }) => {
                return self
                    .classify_quota_trip(handle, service, &detail, &number)
                    .await;
            }
            Err(e) => {
                warn!(session = %handle.id, error = %e, "transcription failed");
                let mut session = handle.state.lock().await;
                session.set_result(ResultCode::Failed(FailReason::SttFailure));
                drop(session);
                return StepEnd::Continue(on_failure);
            }
        };

        let intent = match self
            .llm
            .classify(&scenario.llm.prompt_template, &transcript)
            .await
        {
            // A successful answer is taken as-is; an off-list category
            // falls through route_by_intent's unknown arm.
            Ok(answer) => answer,
            Err(SpeechError::QuotaExhausted { service, detail }) => {
                return self
                    .classify_quota_trip(handle, service, &detail, &number)
                    .await;
            }
            Err(e) => {
                debug!(session = %handle.id, error = %e, "classifier unreachable, using fallback");
                scenario.classify_by_tokens(&transcript)
            }
        };

        info!(session = %handle.id, intent = %intent, transcript = %transcript, "classified");
        let outcome_file = match intent.as_str() {
            "yes" => OutcomeFile::PositiveStt,
            "no" => OutcomeFile::NegativeStt,
            _ => OutcomeFile::UnknownStt,
        };
        self.outcome_logs.append(outcome_file, &number, &transcript);

        {
            let mut session = handle.state.lock().await;
            if intent == "yes" && session.timing.yes_at.is_none() {
                session.timing.yes_at = Some(chrono::Local::now());
            }
            session.transcript = Some(transcript);
            session.intent = Some(intent);
        }
        StepEnd::Continue(next)
    }

    /// Quota refusals are promoted to a dialer pause and end the call.
    async fn classify_quota_trip(
        &self,
        handle: &Arc<SessionHandle>,
        service: SpeechService,
        detail: &str,
        number: &str,
    ) -> StepEnd {
        warn!(session = %handle.id, ?service, detail, customer = %number, "quota exhausted");
        let reason = match service {
            SpeechService::Stt => FailReason::SttQuota,
            SpeechService::Llm => FailReason::LlmQuota,
        };
        {
            let mut session = handle.state.lock().await;
            session.set_result(ResultCode::Failed(reason));
        }
        self.trip_quota_pause(detail).await;
        self.hangup_and_cleanup(handle).await;
        StepEnd::Terminal
    }

    async fn step_transfer(
        &self,
        handle: &Arc<SessionHandle>,
        agent_type: &str,
        on_success: String,
        on_failure: String,
    ) -> StepEnd {
        let kind = match agent_type {
            "inbound" => AgentKind::Inbound,
            _ => AgentKind::Outbound,
        };
        let Some(agent) = self.agents.roster(kind).acquire() else {
            info!(session = %handle.id, "no operator available");
            return StepEnd::Continue(on_failure);
        };

        let (customer_number, bridge_id, onhold) = {
            let mut session = handle.state.lock().await;
            session.agent = Some((kind, agent.clone()));
            (
                session.customer_number.clone(),
                session.bridge_id.clone(),
                session.scenario.prompt("onhold").map(str::to_string),
            )
        };

        // Keep the customer entertained while the operator phone rings.
        if let (Some(bridge_id), Some(onhold)) = (bridge_id.clone(), onhold) {
            let telephony = self.telephony.clone();
            tokio::spawn(async move {
                let _ = telephony.play(&PlayTarget::Bridge(bridge_id), &onhold).await;
            });
        }

        let channel_id = format!("arion-op-{}", uuid::Uuid::new_v4());
        self.by_channel.insert(channel_id.clone(), handle.id.clone());
        let rx = handle.waiters.register(WaitKey::Answer(channel_id.clone()));
        {
            let mut session = handle.state.lock().await;
            session.operator_leg = Some(crate::session::Leg::new(
                channel_id.clone(),
                agent.phone_number.clone(),
                customer_number.clone(),
            ));
        }

        let caller_id = if customer_number.is_empty() {
            self.config.operator.caller_id.clone()
        } else {
            customer_number
        };
        let endpoint = format!(
            "PJSIP/{}@{}",
            agent.phone_number, self.config.operator.trunk
        );
        let origination = self
            .telephony
            .originate(
                &endpoint,
                &caller_id,
                "operator",
                &Default::default(),
                self.config.operator.timeout.as_secs() as u32,
                &channel_id,
            )
            .await;
        if let Err(e) = origination {
            warn!(session = %handle.id, error = %e, "operator origination failed");
            self.release_operator_leg(handle, &channel_id, kind, &agent.phone_number)
                .await;
            return StepEnd::Continue(on_failure);
        }

        match self.wait(handle, rx, self.config.operator.timeout).await {
            Waited::Outcome(WaitOutcome::Answered) => {
                let bridged = match &bridge_id {
                    Some(bridge) => self
                        .telephony
                        .add_channel_to_bridge(bridge, &channel_id)
                        .await
                        .is_ok(),
                    None => false,
                };
                if !bridged {
                    warn!(session = %handle.id, "could not bridge operator leg");
                    let _ = self.telephony.hangup(&channel_id).await;
                    self.release_operator_leg(handle, &channel_id, kind, &agent.phone_number)
                        .await;
                    return StepEnd::Continue(on_failure);
                }
                {
                    let mut session = handle.state.lock().await;
                    session.timing.operator_connected_at = Some(chrono::Local::now());
                    session.set_result(ResultCode::ConnectedToOperator);
                }
                self.report_transition(handle).await;
                info!(session = %handle.id, operator = %agent.phone_number, "operator connected");
                StepEnd::Continue(on_success)
            }
            Waited::Outcome(_) | Waited::Timeout => {
                info!(session = %handle.id, operator = %agent.phone_number, "operator did not answer");
                let _ = self.telephony.hangup(&channel_id).await;
                self.release_operator_leg(handle, &channel_id, kind, &agent.phone_number)
                    .await;
                StepEnd::Continue(on_failure)
            }
            Waited::Cancelled => {
                // Customer hung up while the operator phone was ringing.
                let _ = self.telephony.hangup(&channel_id).await;
                self.release_operator_leg(handle, &channel_id, kind, &agent.phone_number)
                    .await;
                StepEnd::Terminal
            }
        }
    }

    async fn release_operator_leg(
        &self,
        handle: &Arc<SessionHandle>,
        channel_id: &str,
        kind: AgentKind,
        agent_phone: &str,
    ) {
        self.by_channel.remove(channel_id);
        handle.waiters.forget(&WaitKey::Answer(channel_id.to_string()));
        let mut session = handle.state.lock().await;
        session.operator_leg = None;
        session.agent = None;
        drop(session);
        self.agents.roster(kind).release(agent_phone);
    }
}
