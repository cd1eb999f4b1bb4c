//! Arion daemon
//!
//! One long-running process, no subcommands. Configuration comes from the
//! environment (see the engine's config module); the two flags only
//! override the most commonly changed knobs. SIGINT/SIGTERM trigger an
//! orderly shutdown: the dialer stops first, then the event consumer is
//! drained, active scenario tasks are cancelled with a hangup, and queued
//! panel reports are flushed best-effort.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use arion_ari::{AriClient, AriConfig, EventStream, StreamConfig};
use arion_engine::{
    alert::{Alerter, LogAlerter, SmsAlerter},
    config::Config,
    panel::HttpPanel,
    scenario::{self, ScenarioBook},
    speech::{Enhancer, LlmClient, LlmConfig, SttClient, SttConfig},
    Dialer, Engine,
};

/// Outbound/inbound call-control engine.
#[derive(Parser, Debug)]
#[command(name = "arion", version, about)]
struct Args {
    /// Log filter, e.g. `info` or `arion_engine=debug`.
    #[arg(long)]
    log_level: Option<String>,

    /// Directory of scenario YAML files.
    #[arg(long)]
    scenarios_dir: Option<String>,
}

/// Events queued between the stream consumer and the session manager.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Reconnect attempts before the process gives up on the event stream
/// and exits for the supervisor to restart it.
const STREAM_MAX_ATTEMPTS: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(dir) = args.scenarios_dir {
        config.scenarios_dir = dir;
    }

    let filter = args.log_level.unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!(version = env!("CARGO_PKG_VERSION"), "starting arion");

    let scenarios =
        scenario::load_dir(Path::new(&config.scenarios_dir)).context("loading scenarios")?;
    let book = ScenarioBook::new(scenarios);

    let telephony = Arc::new(
        AriClient::new(AriConfig {
            base_url: config.ari.base_url.clone(),
            username: config.ari.username.clone(),
            password: config.ari.password.clone(),
            app_name: config.ari.app_name.clone(),
            timeout: config.ari.timeout,
            max_connections: config.ari.http_max_connections,
        })
        .context("building telephony client")?,
    );

    let stt = Arc::new(
        SttClient::new(
            SttConfig {
                base_url: config.speech.stt_base_url.clone(),
                gateway_token: config.speech.stt_gateway_token.clone(),
                timeout: config.speech.stt_timeout,
                max_parallel: config.speech.max_parallel_stt,
            },
            Enhancer::new(&config.speech.archive_dir),
        )
        .context("building transcription client")?,
    );
    let llm = Arc::new(
        LlmClient::new(LlmConfig {
            base_url: config.speech.llm_base_url.clone(),
            api_key: config.speech.llm_api_key.clone(),
            model: config.speech.llm_model.clone(),
            timeout: config.speech.llm_timeout,
            max_parallel: config.speech.max_parallel_llm,
        })
        .context("building classification client")?,
    );

    let panel = HttpPanel::new(config.panel.clone()).context("building panel client")?;
    let alerter: Arc<dyn Alerter> = if config.sms.api_key.is_empty() {
        Arc::new(LogAlerter)
    } else {
        Arc::new(SmsAlerter::new(
            config.sms.clone(),
            "https://api.sms.ir/v1/send".to_string(),
        ))
    };

    let stream = EventStream::new(StreamConfig {
        ws_url: config.ari.ws_url.clone(),
        app_name: config.ari.app_name.clone(),
        username: config.ari.username.clone(),
        password: config.ari.password.clone(),
        max_attempts: STREAM_MAX_ATTEMPTS,
    });

    let engine = Engine::new(config, telephony, stt, llm, panel.clone(), alerter, book);
    if let Err(e) = engine.register_with_panel().await {
        // The panel being down must not keep calls from starting.
        error!(error = %e, "panel registration failed, continuing");
    }

    let shutdown = engine.shutdown_token();
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let stream_task = tokio::spawn(stream.run(event_tx, shutdown.clone()));
    let events_task = tokio::spawn(engine.clone().run_events(event_rx));
    let retry_task = tokio::spawn(panel.clone().run_retry_loop(shutdown.clone()));

    let dialer = Dialer::new(engine.clone());
    let dialer_task = tokio::spawn(dialer.run(shutdown.clone()));

    wait_for_signal().await;
    info!("shutdown signal received");

    // Dialer first so nothing new is originated, then sessions and the
    // report queue.
    shutdown.cancel();
    let _ = dialer_task.await;
    engine.shutdown().await;
    let _ = events_task.await;
    match stream_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "event stream ended with error"),
        Err(e) => error!(error = %e, "event stream task panicked"),
    }
    let _ = retry_task.await;

    info!("arion stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
