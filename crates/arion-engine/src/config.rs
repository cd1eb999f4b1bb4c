//! Engine configuration
//!
//! All knobs are read from the process environment (the deployment wrapper
//! owns `.env` handling). Every option has a default suitable for a lab
//! setup; `Config::from_env` only fails on values that are present but
//! unparseable, so a misspelled number is caught at startup rather than
//! silently defaulted.

use std::env;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Telephony server connection settings.
#[derive(Debug, Clone)]
pub struct AriSettings {
    pub base_url: String,
    pub ws_url: String,
    pub app_name: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub http_max_connections: usize,
}

impl Default for AriSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088/ari".into(),
            ws_url: "ws://127.0.0.1:8088/ari/events".into(),
            app_name: "arion".into(),
            username: "asterisk".into(),
            password: "asterisk".into(),
            timeout: Duration::from_secs(10),
            http_max_connections: 32,
        }
    }
}

/// Multi-dimensional origination limits.
#[derive(Debug, Clone)]
pub struct LimitSettings {
    /// Per-line ceiling on simultaneous calls, inbound plus outbound.
    pub max_concurrent_calls: u32,
    /// Per-line sliding-window ceiling over the last 60 seconds.
    pub max_calls_per_minute: u32,
    /// Per-line ceiling per local calendar day.
    pub max_calls_per_day: u32,
    /// Global origination throttle, per second.
    pub max_originations_per_second: u32,
    pub max_concurrent_inbound: u32,
    pub max_concurrent_outbound: u32,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 4,
            max_calls_per_minute: 10,
            max_calls_per_day: 400,
            max_originations_per_second: 2,
            max_concurrent_inbound: 8,
            max_concurrent_outbound: 8,
        }
    }
}

/// Dialer behaviour.
#[derive(Debug, Clone)]
pub struct DialerSettings {
    /// Trunk name outbound dials go through, e.g. `to-provider`.
    pub outbound_trunk: String,
    /// Configured outbound line numbers, in priority (configuration) order.
    pub outbound_numbers: Vec<String>,
    pub default_caller_id: String,
    /// How long to wait for the originated channel to surface on the
    /// event stream before declaring the attempt missed.
    pub origination_timeout: Duration,
    pub batch_size: u32,
    /// Sleep applied when paused or when the panel has nothing for us.
    pub default_retry: Duration,
    /// Contacts used when no panel is configured.
    pub static_contacts: Vec<String>,
    /// Consecutive origination failures that trip the auto-pause.
    pub fail_alert_threshold: u32,
}

impl Default for DialerSettings {
    fn default() -> Self {
        Self {
            outbound_trunk: "outbound".into(),
            outbound_numbers: Vec::new(),
            default_caller_id: String::new(),
            origination_timeout: Duration::from_secs(45),
            batch_size: 10,
            default_retry: Duration::from_secs(15),
            static_contacts: Vec::new(),
            fail_alert_threshold: 5,
        }
    }
}

/// Campaign panel connection. `base_url = None` disables the panel and
/// switches the dialer to static contacts.
#[derive(Debug, Clone, Default)]
pub struct PanelSettings {
    pub base_url: Option<String>,
    pub api_token: String,
    pub company: String,
    pub timeout: Duration,
}

/// Transcription and classification services.
#[derive(Debug, Clone)]
pub struct SpeechSettings {
    pub stt_base_url: String,
    pub stt_gateway_token: String,
    pub stt_timeout: Duration,
    pub max_parallel_stt: usize,
    pub max_parallel_tts: usize,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_timeout: Duration,
    pub max_parallel_llm: usize,
    /// Enhanced-audio copies are archived here for audit.
    pub archive_dir: String,
    /// Where the telephony server writes recordings we read back.
    pub recordings_dir: String,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            stt_base_url: String::new(),
            stt_gateway_token: String::new(),
            stt_timeout: Duration::from_secs(30),
            max_parallel_stt: 4,
            max_parallel_tts: 2,
            llm_base_url: String::new(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".into(),
            llm_timeout: Duration::from_secs(20),
            max_parallel_llm: 4,
            archive_dir: "archive".into(),
            recordings_dir: "/var/spool/asterisk/recording".into(),
        }
    }
}

/// Operator transfer settings.
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    pub extension: String,
    pub trunk: String,
    pub caller_id: String,
    /// How long an operator leg may ring before the transfer fails.
    pub timeout: Duration,
    /// Static fallback roster used until the first panel batch arrives.
    pub mobile_numbers: Vec<String>,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            extension: String::new(),
            trunk: "operators".into(),
            caller_id: String::new(),
            timeout: Duration::from_secs(30),
            mobile_numbers: Vec::new(),
        }
    }
}

/// SMS alert delivery.
#[derive(Debug, Clone, Default)]
pub struct SmsSettings {
    pub api_key: String,
    pub from: String,
    pub admins: Vec<String>,
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ari: AriSettings,
    pub limits: LimitSettings,
    pub dialer: DialerSettings,
    pub panel: PanelSettings,
    pub speech: SpeechSettings,
    pub operator: OperatorSettings,
    pub sms: SmsSettings,
    pub scenarios_dir: String,
    pub call_log_dir: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ari: AriSettings::default(),
            limits: LimitSettings::default(),
            dialer: DialerSettings::default(),
            panel: PanelSettings::default(),
            speech: SpeechSettings::default(),
            operator: OperatorSettings::default(),
            sms: SmsSettings::default(),
            scenarios_dir: "scenarios".into(),
            call_log_dir: "logs".into(),
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        let ari = &mut config.ari;
        set_str(&mut ari.base_url, "ARI_BASE_URL");
        set_str(&mut ari.ws_url, "ARI_WS_URL");
        set_str(&mut ari.app_name, "ARI_APP_NAME");
        set_str(&mut ari.username, "ARI_USERNAME");
        set_str(&mut ari.password, "ARI_PASSWORD");
        set_secs(&mut ari.timeout, "ARI_TIMEOUT")?;
        set_parse(&mut ari.http_max_connections, "HTTP_MAX_CONNECTIONS")?;

        let limits = &mut config.limits;
        set_parse(&mut limits.max_concurrent_calls, "MAX_CONCURRENT_CALLS")?;
        set_parse(&mut limits.max_calls_per_minute, "MAX_CALLS_PER_MINUTE")?;
        set_parse(&mut limits.max_calls_per_day, "MAX_CALLS_PER_DAY")?;
        set_parse(
            &mut limits.max_originations_per_second,
            "MAX_ORIGINATIONS_PER_SECOND",
        )?;
        set_parse(
            &mut limits.max_concurrent_inbound,
            "MAX_CONCURRENT_INBOUND_CALLS",
        )?;
        set_parse(
            &mut limits.max_concurrent_outbound,
            "MAX_CONCURRENT_OUTBOUND_CALLS",
        )?;

        let dialer = &mut config.dialer;
        set_str(&mut dialer.outbound_trunk, "OUTBOUND_TRUNK");
        set_list(&mut dialer.outbound_numbers, "OUTBOUND_NUMBERS");
        set_str(&mut dialer.default_caller_id, "DEFAULT_CALLER_ID");
        set_secs(&mut dialer.origination_timeout, "ORIGINATION_TIMEOUT")?;
        set_parse(&mut dialer.batch_size, "DIALER_BATCH_SIZE")?;
        set_secs(&mut dialer.default_retry, "DIALER_DEFAULT_RETRY")?;
        set_list(&mut dialer.static_contacts, "STATIC_CONTACTS");
        set_parse(&mut dialer.fail_alert_threshold, "FAIL_ALERT_THRESHOLD")?;

        let panel = &mut config.panel;
        panel.base_url = env::var("PANEL_BASE_URL").ok().filter(|s| !s.is_empty());
        set_str(&mut panel.api_token, "PANEL_API_TOKEN");
        set_str(&mut panel.company, "COMPANY");
        panel.timeout = Duration::from_secs(15);
        set_secs(&mut panel.timeout, "PANEL_TIMEOUT")?;

        let speech = &mut config.speech;
        set_str(&mut speech.stt_base_url, "STT_BASE_URL");
        set_str(&mut speech.stt_gateway_token, "STT_GATEWAY_TOKEN");
        set_secs(&mut speech.stt_timeout, "STT_TIMEOUT")?;
        set_parse(&mut speech.max_parallel_stt, "MAX_PARALLEL_STT")?;
        set_parse(&mut speech.max_parallel_tts, "MAX_PARALLEL_TTS")?;
        set_str(&mut speech.llm_base_url, "LLM_BASE_URL");
        set_str(&mut speech.llm_api_key, "LLM_API_KEY");
        set_str(&mut speech.llm_model, "LLM_MODEL");
        set_secs(&mut speech.llm_timeout, "LLM_TIMEOUT")?;
        set_parse(&mut speech.max_parallel_llm, "MAX_PARALLEL_LLM")?;
        set_str(&mut speech.archive_dir, "AUDIO_ARCHIVE_DIR");
        set_str(&mut speech.recordings_dir, "RECORDINGS_DIR");

        let operator = &mut config.operator;
        set_str(&mut operator.extension, "OPERATOR_EXTENSION");
        set_str(&mut operator.trunk, "OPERATOR_TRUNK");
        set_str(&mut operator.caller_id, "OPERATOR_CALLER_ID");
        set_secs(&mut operator.timeout, "OPERATOR_TIMEOUT")?;
        set_list(&mut operator.mobile_numbers, "OPERATOR_MOBILE_NUMBERS");

        let sms = &mut config.sms;
        set_str(&mut sms.api_key, "SMS_API_KEY");
        set_str(&mut sms.from, "SMS_FROM");
        set_list(&mut sms.admins, "SMS_ADMINS");

        set_str(&mut config.scenarios_dir, "SCENARIOS_DIR");
        set_str(&mut config.call_log_dir, "CALL_LOG_DIR");
        set_str(&mut config.log_level, "LOG_LEVEL");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_originations_per_second == 0 {
            return Err(EngineError::config(
                "MAX_ORIGINATIONS_PER_SECOND must be at least 1",
            ));
        }
        if self.limits.max_concurrent_calls == 0 {
            return Err(EngineError::config("MAX_CONCURRENT_CALLS must be at least 1"));
        }
        if self.panel.base_url.is_some() && self.panel.company.is_empty() {
            return Err(EngineError::config("COMPANY is required when the panel is enabled"));
        }
        if self.panel.base_url.is_none() && self.dialer.static_contacts.is_empty() {
            tracing::warn!("panel disabled and STATIC_CONTACTS empty; dialer will idle");
        }
        Ok(())
    }
}

fn set_str(slot: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn set_list(slot: &mut Vec<String>, key: &str) {
    if let Ok(value) = env::var(key) {
        *slot = value
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect();
    }
}

fn set_parse<T: std::str::FromStr>(slot: &mut T, key: &str) -> Result<()> {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *slot = value
                .parse()
                .map_err(|_| EngineError::config(format!("{key}: cannot parse `{value}`")))?;
        }
    }
    Ok(())
}

fn set_secs(slot: &mut Duration, key: &str) -> Result<()> {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            let secs: u64 = value
                .parse()
                .map_err(|_| EngineError::config(format!("{key}: cannot parse `{value}`")))?;
            *slot = Duration::from_secs(secs);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_throttle_is_rejected() {
        let mut config = Config::default();
        config.limits.max_originations_per_second = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn panel_requires_company() {
        let mut config = Config::default();
        config.panel.base_url = Some("https://panel.example".into());
        config.panel.company = String::new();
        assert!(config.validate().is_err());
    }
}
