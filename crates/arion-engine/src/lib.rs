//! Arion call engine
//!
//! The orchestration layer of the Arion dialer: session management over
//! the telephony server's control interface, declarative scenario flows,
//! speech transcription and intent classification, campaign-panel
//! integration and the rate-limited outbound dialer.
//!
//! The crate is wired together through [`Engine`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use arion_engine::{
//!     alert::LogAlerter,
//!     config::Config,
//!     panel::HttpPanel,
//!     scenario::{self, ScenarioBook},
//!     speech::{Enhancer, LlmClient, LlmConfig, SttClient, SttConfig},
//!     Dialer, Engine,
//! };
//! use arion_ari::{AriClient, AriConfig};
//!
//! # async fn wire() -> arion_engine::Result<()> {
//! let config = Config::from_env()?;
//! let scenarios = scenario::load_dir(std::path::Path::new(&config.scenarios_dir))?;
//! let ari = Arc::new(AriClient::new(AriConfig::default())?);
//! let stt = Arc::new(SttClient::new(
//!     SttConfig {
//!         base_url: config.speech.stt_base_url.clone(),
//!         gateway_token: config.speech.stt_gateway_token.clone(),
//!         timeout: config.speech.stt_timeout,
//!         max_parallel: config.speech.max_parallel_stt,
//!     },
//!     Enhancer::new(&config.speech.archive_dir),
//! )?);
//! let llm = Arc::new(LlmClient::new(LlmConfig {
//!     base_url: config.speech.llm_base_url.clone(),
//!     api_key: config.speech.llm_api_key.clone(),
//!     model: config.speech.llm_model.clone(),
//!     timeout: config.speech.llm_timeout,
//!     max_parallel: config.speech.max_parallel_llm,
//! })?);
//! let panel = HttpPanel::new(config.panel.clone())?;
//! let engine = Engine::new(
//!     config,
//!     ari,
//!     stt,
//!     llm,
//!     panel,
//!     Arc::new(LogAlerter),
//!     ScenarioBook::new(scenarios),
//! );
//! let dialer = Dialer::new(engine.clone());
//! # let _ = dialer;
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod alert;
pub mod calllog;
pub mod config;
pub mod dialer;
mod engine;
pub mod error;
mod flow;
pub mod lines;
pub mod numbers;
pub mod panel;
pub mod results;
pub mod scenario;
pub mod session;
pub mod speech;
pub mod telephony;

pub use dialer::{Dialer, PauseReason, PauseState};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, Result};
