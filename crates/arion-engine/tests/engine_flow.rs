//! End-to-end engine tests
//!
//! The engine runs against in-process fakes of the telephony server, the
//! speech services and the campaign panel. Tests drive the event stream
//! by hand: the fake telephony records what the engine asked for, the test
//! answers with the events a real server would emit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use arion_ari::{AriError, AriEvent, CallerId, Channel, Dialplan, LiveRecording, Playback};
use arion_engine::{
    alert::Alerter,
    config::Config,
    panel::{ActiveScenario, Batch, CallReport, Contact, Panel, PanelAgent, PanelLine},
    results::PanelStatus,
    scenario::{Scenario, ScenarioBook},
    speech::{IntentClassifier, SpeechError, SpeechResult, SpeechService, SpeechToText},
    telephony::Telephony,
    Dialer, Engine,
};

// ── Fakes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Origination {
    endpoint: String,
    caller_id: String,
    channel_id: String,
}

#[derive(Debug, Clone)]
struct StartedPlayback {
    id: String,
    target: String,
    media: String,
}

#[derive(Default)]
struct FakeTelephony {
    seq: AtomicU32,
    originations: Mutex<Vec<Origination>>,
    playbacks: Mutex<Vec<StartedPlayback>>,
    recordings: Mutex<Vec<String>>,
    hangups: Mutex<Vec<String>>,
    bridges: Mutex<Vec<String>>,
    destroyed_bridges: Mutex<Vec<String>>,
    recordings_dir: Mutex<PathBuf>,
}

impl FakeTelephony {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.seq.fetch_add(1, Ordering::SeqCst))
    }

    fn write_wav(&self, name: &str) {
        let path = self.recordings_dir.lock().join(format!("{name}.wav"));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..8000 {
            writer
                .write_sample(if i % 2 == 0 { 11000i16 } else { -11000 })
                .unwrap();
        }
        writer.finalize().unwrap();
    }
}

#[async_trait]
impl Telephony for FakeTelephony {
    async fn answer(&self, _channel_id: &str) -> arion_ari::Result<()> {
        Ok(())
    }

    async fn hangup(&self, channel_id: &str) -> arion_ari::Result<()> {
        self.hangups.lock().push(channel_id.to_string());
        Ok(())
    }

    async fn originate(
        &self,
        endpoint: &str,
        caller_id: &str,
        _app_args: &str,
        _channel_vars: &HashMap<String, String>,
        _timeout_secs: u32,
        channel_id: &str,
    ) -> arion_ari::Result<String> {
        self.originations.lock().push(Origination {
            endpoint: endpoint.to_string(),
            caller_id: caller_id.to_string(),
            channel_id: channel_id.to_string(),
        });
        Ok(channel_id.to_string())
    }

    async fn create_bridge(&self) -> arion_ari::Result<String> {
        let id = self.next("bridge");
        self.bridges.lock().push(id.clone());
        Ok(id)
    }

    async fn add_channel_to_bridge(
        &self,
        _bridge_id: &str,
        _channel_id: &str,
    ) -> arion_ari::Result<()> {
        Ok(())
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> arion_ari::Result<()> {
        self.destroyed_bridges.lock().push(bridge_id.to_string());
        Ok(())
    }

    async fn play(
        &self,
        target: &arion_ari::PlayTarget,
        media_ref: &str,
    ) -> arion_ari::Result<String> {
        let id = self.next("pb");
        let target = match target {
            arion_ari::PlayTarget::Bridge(b) => format!("bridge:{b}"),
            arion_ari::PlayTarget::Channel(c) => format!("channel:{c}"),
        };
        self.playbacks.lock().push(StartedPlayback {
            id: id.clone(),
            target,
            media: media_ref.to_string(),
        });
        Ok(id)
    }

    async fn record(
        &self,
        _channel_id: &str,
        name: &str,
        _max_duration_secs: u32,
        _max_silence_secs: u32,
    ) -> arion_ari::Result<String> {
        self.write_wav(name);
        self.recordings.lock().push(name.to_string());
        Ok(name.to_string())
    }

    async fn stop_recording(&self, _name: &str) -> arion_ari::Result<()> {
        Ok(())
    }

    async fn get_channel_var(&self, _channel_id: &str, _name: &str) -> arion_ari::Result<String> {
        Err(AriError::NotFound("no vars in fake".into()))
    }
}

struct FakeStt {
    results: Mutex<Vec<SpeechResult<String>>>,
}

#[async_trait]
impl SpeechToText for FakeStt {
    async fn transcribe(&self, _recording: &Path, _hotwords: &[String]) -> SpeechResult<String> {
        self.results
            .lock()
            .pop()
            .unwrap_or_else(|| Ok("الو".to_string()))
    }
}

struct FakeLlm {
    results: Mutex<Vec<SpeechResult<String>>>,
}

#[async_trait]
impl IntentClassifier for FakeLlm {
    async fn classify(&self, _template: &str, _transcript: &str) -> SpeechResult<String> {
        self.results
            .lock()
            .pop()
            .unwrap_or_else(|| Ok("unknown".to_string()))
    }
}

struct FakePanel {
    batches: Mutex<Vec<Batch>>,
    reports: Mutex<Vec<CallReport>>,
    call_allowed_sets: Mutex<Vec<bool>>,
}

impl FakePanel {
    fn new(batches: Vec<Batch>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches),
            reports: Mutex::new(Vec::new()),
            call_allowed_sets: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Panel for FakePanel {
    fn enabled(&self) -> bool {
        true
    }

    async fn register_scenarios(&self, _scenarios: &[(String, String)]) -> arion_engine::Result<()> {
        Ok(())
    }

    async fn register_lines(&self, _lines: &[(String, String)]) -> arion_engine::Result<()> {
        Ok(())
    }

    async fn next_batch(&self, _size: u32) -> arion_engine::Result<Option<Batch>> {
        let mut batches = self.batches.lock();
        match batches.pop() {
            Some(batch) => Ok(Some(batch)),
            None => Ok(Some(Batch {
                call_allowed: true,
                ..Default::default()
            })),
        }
    }

    async fn report(&self, report: CallReport) {
        self.reports.lock().push(report);
    }

    async fn set_call_allowed(&self, allowed: bool) {
        self.call_allowed_sets.lock().push(allowed);
    }

    async fn flush(&self) {}
}

#[derive(Default)]
struct FakeAlerter {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Alerter for FakeAlerter {
    async fn send(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

// ── Harness ──────────────────────────────────────────────────────────

fn scenario_yaml(transfer: bool) -> String {
    let accept = if transfer {
        r#"
    accept:
      kind: transfer_to_operator
      agent_type: outbound
      on_success: hold
      on_failure: fail_result
    hold: { kind: wait }
    fail_result: { kind: set_result, result: disconnected, next: bye }"#
    } else {
        r#"
    accept: { kind: set_result, result: connected_to_operator, next: play_yes }
    play_yes: { kind: play_prompt, prompt: yes_prompt, next: done }"#
    };
    format!(
        r#"
company: acme
name: salehi
display_name: "Salehi campaign"
transfer_to_operator: {transfer}
prompts:
  hello: sound:custom/hello
  yes_prompt: sound:custom/yes
  number: sound:custom/number
  goodby: sound:custom/goodby
stt:
  hotwords: ["بیمه"]
  max_duration_seconds: 8
  max_silence_seconds: 2
llm:
  prompt_template: "One word answer. Caller said: {{transcript}}"
  intents: ["yes", "no", "number_question"]
  fallback_tokens:
    "yes": ["بله", "باشه"]
    "no": ["نه"]
flow:
  steps:
    entry: {{ kind: entry, next: greet }}
    greet: {{ kind: play_prompt, prompt: hello, next: listen }}
    listen: {{ kind: record, next: classify, on_empty: bye, on_failure: bye }}
    classify: {{ kind: classify_intent, next: branch, on_failure: bye }}
    branch:
      kind: route_by_intent
      routes: {{ "yes": accept, "no": refuse, number_question: number_q, unknown: bye }}
    number_q: {{ kind: play_prompt, prompt: number, next: retry_check }}
    retry_check:
      kind: check_retry_limit
      counter: number_asked
      limit: 2
      over: bye
      under: listen
    refuse: {{ kind: set_result, result: not_interested, next: bye }}
    bye: {{ kind: play_prompt, prompt: goodby, next: done }}
    done: {{ kind: disconnect }}{accept}
"#
    )
}

fn one_contact_batch() -> Batch {
    Batch {
        call_allowed: true,
        contacts: vec![Contact {
            id: 42,
            phone_number: "09123456789".into(),
            metadata: None,
        }],
        active_scenarios: vec![ActiveScenario {
            id: 5,
            name: "salehi".into(),
        }],
        outbound_lines: vec![PanelLine {
            id: 7,
            phone_number: "02191302954".into(),
            display_name: "main line".into(),
        }],
        inbound_agents: vec![],
        outbound_agents: vec![PanelAgent {
            id: 9,
            phone_number: "09350001122".into(),
        }],
    }
}

struct Harness {
    engine: Arc<Engine>,
    telephony: Arc<FakeTelephony>,
    panel: Arc<FakePanel>,
    alerter: Arc<FakeAlerter>,
    events: mpsc::Sender<AriEvent>,
    shutdown: CancellationToken,
    _dirs: (tempfile::TempDir, tempfile::TempDir, tempfile::TempDir),
}

impl Harness {
    fn start(
        transfer: bool,
        stt_results: Vec<SpeechResult<String>>,
        llm_results: Vec<SpeechResult<String>>,
        batches: Vec<Batch>,
    ) -> Harness {
        let recordings = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.dialer.outbound_numbers = vec!["02191302954".into()];
        config.dialer.default_retry = Duration::from_millis(30);
        config.dialer.origination_timeout = Duration::from_secs(5);
        config.dialer.fail_alert_threshold = 3;
        config.operator.trunk = "operators".into();
        config.operator.timeout = Duration::from_millis(250);
        config.panel.company = "acme".into();
        config.speech.recordings_dir = recordings.path().display().to_string();
        config.speech.archive_dir = archive.path().display().to_string();
        config.call_log_dir = logs.path().display().to_string();

        let telephony = Arc::new(FakeTelephony::default());
        *telephony.recordings_dir.lock() = recordings.path().to_path_buf();
        let stt = Arc::new(FakeStt {
            results: Mutex::new(stt_results),
        });
        let llm = Arc::new(FakeLlm {
            results: Mutex::new(llm_results),
        });
        let panel = FakePanel::new(batches);
        let alerter = Arc::new(FakeAlerter::default());

        let scenario: Scenario = serde_yaml::from_str(&scenario_yaml(transfer)).unwrap();
        arion_engine::scenario::validate(&scenario).unwrap();
        let mut scenarios = HashMap::new();
        scenarios.insert(scenario.name.clone(), scenario);

        let engine = Engine::new(
            config,
            telephony.clone(),
            stt,
            llm,
            panel.clone(),
            alerter.clone(),
            ScenarioBook::new(scenarios),
        );
        let shutdown = engine.shutdown_token();

        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(engine.clone().run_events(event_rx));
        tokio::spawn(Dialer::new(engine.clone()).run(shutdown.clone()));

        Harness {
            engine,
            telephony,
            panel,
            alerter,
            events: event_tx,
            shutdown,
            _dirs: (recordings, archive, logs),
        }
    }

    async fn send(&self, event: AriEvent) {
        self.events.send(event).await.unwrap();
    }

    /// Wait for the nth origination and answer it.
    async fn expect_origination(&self, index: usize) -> Origination {
        wait_until(|| self.telephony.originations.lock().len() > index).await;
        self.telephony.originations.lock()[index].clone()
    }

    async fn answer_customer(&self, channel_id: &str) {
        self.send(AriEvent::StasisStart {
            channel: channel(channel_id, "Up", "09123456789"),
            args: vec!["outbound".into()],
        })
        .await;
    }

    /// Wait for the nth playback and report it finished.
    async fn finish_playback(&self, index: usize) -> StartedPlayback {
        wait_until(|| self.telephony.playbacks.lock().len() > index).await;
        let playback = self.telephony.playbacks.lock()[index].clone();
        self.send(AriEvent::PlaybackFinished {
            playback: Playback {
                id: playback.id.clone(),
                media_uri: playback.media.clone(),
                target_uri: playback.target.clone(),
            },
        })
        .await;
        playback
    }

    /// Wait for the nth recording and report it finished.
    async fn finish_recording(&self, index: usize) -> String {
        wait_until(|| self.telephony.recordings.lock().len() > index).await;
        let name = self.telephony.recordings.lock()[index].clone();
        self.send(AriEvent::RecordingFinished {
            recording: LiveRecording {
                name: name.clone(),
                format: "wav".into(),
                cause: None,
            },
        })
        .await;
        name
    }

    async fn wait_reports(&self, count: usize) -> Vec<CallReport> {
        wait_until(|| self.panel.reports.lock().len() >= count).await;
        self.panel.reports.lock().clone()
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.engine.shutdown().await;
    }
}

fn channel(id: &str, state: &str, number: &str) -> Channel {
    Channel {
        id: id.to_string(),
        name: format!("PJSIP/{id}"),
        state: state.to_string(),
        caller: CallerId {
            name: String::new(),
            number: number.to_string(),
        },
        dialplan: Dialplan::default(),
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_yes_on_transfer_disabled_scenario() {
    let harness = Harness::start(
        false,
        vec![Ok("بله حتما".into())],
        vec![Ok("yes".into())],
        vec![one_contact_batch()],
    );

    let origination = harness.expect_origination(0).await;
    assert_eq!(origination.endpoint, "PJSIP/295409123456789@outbound");
    assert_eq!(origination.caller_id, "02191302954");

    harness.answer_customer(&origination.channel_id).await;
    let hello = harness.finish_playback(0).await;
    assert_eq!(hello.media, "sound:custom/hello");
    harness.finish_recording(0).await;
    let yes_prompt = harness.finish_playback(1).await;
    assert_eq!(yes_prompt.media, "sound:custom/yes");

    harness.wait_reports(1).await;
    wait_until(|| harness.engine.stats().active_sessions == 0).await;
    settle().await;

    let reports = harness.panel.reports.lock().clone();
    assert_eq!(reports.len(), 1, "exactly one report: {reports:?}");
    let report = &reports[0];
    assert_eq!(report.status, PanelStatus::Connected);
    assert_eq!(report.phone_number, "09123456789");
    assert_eq!(report.number_id, Some(42));
    assert_eq!(report.outbound_line_id, Some(7));
    assert_eq!(report.scenario_id, Some(5));
    assert_eq!(report.user_message.as_deref(), Some("بله حتما"));

    // The customer leg was hung up and the bridge destroyed exactly once.
    assert_eq!(harness.telephony.hangups.lock().len(), 1);
    assert_eq!(harness.telephony.destroyed_bridges.lock().len(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn clear_no_reports_not_interested_with_transcript() {
    let harness = Harness::start(
        false,
        vec![Ok("نه، ممنون".into())],
        vec![Ok("no".into())],
        vec![one_contact_batch()],
    );

    let origination = harness.expect_origination(0).await;
    harness.answer_customer(&origination.channel_id).await;
    harness.finish_playback(0).await;
    harness.finish_recording(0).await;
    let goodby = harness.finish_playback(1).await;
    assert_eq!(goodby.media, "sound:custom/goodby");

    let reports = harness.wait_reports(1).await;
    assert_eq!(reports[0].status, PanelStatus::NotInterested);
    assert_eq!(reports[0].user_message.as_deref(), Some("نه، ممنون"));
    harness.stop().await;
}

#[tokio::test]
async fn number_question_loops_then_connects_once() {
    let harness = Harness::start(
        false,
        // Popped from the back: first the question, then the yes.
        vec![Ok("باشه".into()), Ok("شماره منو از کجا آوردید".into())],
        vec![Ok("yes".into()), Ok("number_question".into())],
        vec![one_contact_batch()],
    );

    let origination = harness.expect_origination(0).await;
    harness.answer_customer(&origination.channel_id).await;
    harness.finish_playback(0).await; // hello
    harness.finish_recording(0).await; // -> number_question
    let number = harness.finish_playback(1).await;
    assert_eq!(number.media, "sound:custom/number");
    harness.finish_recording(1).await; // -> yes
    harness.finish_playback(2).await; // yes prompt

    let reports = harness.wait_reports(1).await;
    wait_until(|| harness.engine.stats().active_sessions == 0).await;
    assert_eq!(reports.len(), 1, "one report despite the loop: {reports:?}");
    assert_eq!(reports[0].status, PanelStatus::Connected);
    harness.stop().await;
}

#[tokio::test]
async fn sip_busy_skips_scenario_and_reports_busy() {
    let harness = Harness::start(false, vec![], vec![], vec![one_contact_batch()]);

    let origination = harness.expect_origination(0).await;
    // Far end is busy: no answer, hangup with cause 17.
    harness
        .send(AriEvent::ChannelHangupRequest {
            channel: channel(&origination.channel_id, "Down", "09123456789"),
            cause: Some(17),
        })
        .await;

    let reports = harness.wait_reports(1).await;
    assert_eq!(reports[0].status, PanelStatus::Busy);
    assert!(reports[0].user_message.is_none());
    settle().await;
    // No scenario step ran.
    assert!(harness.telephony.playbacks.lock().is_empty());
    assert!(harness.telephony.recordings.lock().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn operator_transfer_timeout_reports_disconnected_and_frees_agent() {
    let harness = Harness::start(
        true,
        vec![Ok("بله حتما".into())],
        vec![Ok("yes".into())],
        vec![one_contact_batch()],
    );

    let origination = harness.expect_origination(0).await;
    harness.answer_customer(&origination.channel_id).await;
    harness.finish_playback(0).await;
    harness.finish_recording(0).await;

    // The operator leg goes out but never answers.
    let operator = harness.expect_origination(1).await;
    assert_eq!(operator.endpoint, "PJSIP/09350001122@operators");
    assert_eq!(operator.caller_id, "09123456789");

    // Timeout fires, the flow takes the failure branch.
    let goodby_index = {
        wait_until(|| {
            harness
                .telephony
                .playbacks
                .lock()
                .iter()
                .any(|p| p.media == "sound:custom/goodby")
        })
        .await;
        let playbacks = harness.telephony.playbacks.lock();
        playbacks
            .iter()
            .position(|p| p.media == "sound:custom/goodby")
            .unwrap()
    };
    harness.finish_playback(goodby_index).await;

    let reports = harness.wait_reports(1).await;
    wait_until(|| harness.engine.stats().active_sessions == 0).await;
    assert_eq!(reports[0].status, PanelStatus::Disconnected);
    assert_eq!(reports[0].user_message.as_deref(), Some("بله حتما"));
    // The operator leg was hung up and the agent is available again.
    assert!(harness
        .telephony
        .hangups
        .lock()
        .contains(&operator.channel_id));
    assert_eq!(harness.engine.stats().available_outbound_agents, 1);
    harness.stop().await;
}

#[tokio::test]
async fn stt_quota_pauses_dialer_and_alerts() {
    let harness = Harness::start(
        false,
        vec![Err(SpeechError::QuotaExhausted {
            service: SpeechService::Stt,
            detail: "HTTP 403".into(),
        })],
        vec![],
        vec![one_contact_batch()],
    );

    let origination = harness.expect_origination(0).await;
    harness.answer_customer(&origination.channel_id).await;
    harness.finish_playback(0).await;
    harness.finish_recording(0).await;

    wait_until(|| harness.engine.stats().paused).await;
    wait_until(|| !harness.alerter.messages.lock().is_empty()).await;
    wait_until(|| harness.panel.call_allowed_sets.lock().contains(&false)).await;

    let reports = harness.wait_reports(1).await;
    assert_eq!(reports[0].status, PanelStatus::Failed);
    assert_eq!(reports[0].reason, "failed:vira_quota");

    // Paused: no further originations even though batches keep coming.
    settle().await;
    assert_eq!(harness.telephony.originations.lock().len(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn call_allowed_false_holds_new_originations() {
    let mut batch = one_contact_batch();
    batch.call_allowed = false;
    // The fake pops one batch per poll; keep the verdict steady.
    let harness = Harness::start(false, vec![], vec![], vec![batch; 50]);

    settle().await;
    settle().await;
    assert!(harness.telephony.originations.lock().is_empty());
    assert!(harness.engine.stats().paused);
    harness.stop().await;
}

#[tokio::test]
async fn origination_rejection_counts_toward_cascade() {
    // Three contacts, each origination attempt will be answered busy
    // before any scenario runs. Threshold is 3: the third failure pauses
    // the dialer and alerts.
    let mut batch = one_contact_batch();
    batch.contacts = (0..3)
        .map(|n| Contact {
            id: 100 + n,
            phone_number: format!("0912000{n:04}"),
            metadata: None,
        })
        .collect();
    let harness = Harness::start(false, vec![], vec![], vec![batch]);

    for index in 0..3 {
        let origination = harness.expect_origination(index).await;
        harness
            .send(AriEvent::ChannelHangupRequest {
                channel: channel(&origination.channel_id, "Down", "0912"),
                cause: Some(17),
            })
            .await;
        let _ = harness.wait_reports(index + 1).await;
    }

    wait_until(|| harness.engine.stats().paused).await;
    wait_until(|| !harness.alerter.messages.lock().is_empty()).await;
    let message = harness.alerter.messages.lock()[0].clone();
    assert!(message.contains("consecutive"), "{message}");
    harness.stop().await;
}
