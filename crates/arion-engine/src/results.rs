//! Result codes and the panel status translator
//!
//! Internal result codes capture how a call ended from the engine's point
//! of view; the panel speaks a flatter status vocabulary. The mapping is
//! total (every code maps) and idempotent (a mapped status maps to itself),
//! and it decides which statuses carry the caller's transcript.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a call attempt failed, when it did.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailReason {
    /// Recording unusable or transcription transiently failing.
    SttFailure,
    /// Transcription service out of balance.
    SttQuota,
    /// Classification service out of balance.
    LlmQuota,
    /// Anything else, annotated.
    Other(String),
}

/// Terminal result of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The prospect said yes: either the YES prompt completed on a
    /// non-transfer scenario, or the operator leg was answered.
    ConnectedToOperator,
    NotInterested,
    /// Transfer was required but did not complete.
    Disconnected,
    /// Intent could not be determined.
    Unknown,
    /// The caller hung up mid-flow.
    Hangup,
    Missed,
    UserDidntAnswer,
    Busy,
    PowerOff,
    Banned,
    Failed(FailReason),
}

impl ResultCode {
    /// Map a SIP cause code from a non-answer disposition.
    ///
    /// Causes observed before any `answered` state yield an early terminal
    /// result; no scenario steps run for these.
    pub fn from_sip_cause(cause: u32) -> ResultCode {
        match cause {
            17 => ResultCode::Busy,
            18 | 19 | 20 => ResultCode::PowerOff,
            21 | 34 | 41 | 42 => ResultCode::Banned,
            _ => ResultCode::Missed,
        }
    }

    /// Internal wire/log name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::ConnectedToOperator => "connected_to_operator",
            ResultCode::NotInterested => "not_interested",
            ResultCode::Disconnected => "disconnected",
            ResultCode::Unknown => "unknown",
            ResultCode::Hangup => "hangup",
            ResultCode::Missed => "missed",
            ResultCode::UserDidntAnswer => "user_didnt_answer",
            ResultCode::Busy => "busy",
            ResultCode::PowerOff => "power_off",
            ResultCode::Banned => "banned",
            ResultCode::Failed(FailReason::SttFailure) => "failed:stt_failure",
            ResultCode::Failed(FailReason::SttQuota) => "failed:vira_quota",
            ResultCode::Failed(FailReason::LlmQuota) => "failed:llm_quota",
            ResultCode::Failed(FailReason::Other(_)) => "failed:other",
        }
    }

    /// Round-trippable name including annotated failures.
    fn wire_name(&self) -> String {
        match self {
            ResultCode::Failed(FailReason::Other(detail)) => format!("failed:{detail}"),
            other => other.as_str().to_string(),
        }
    }

    /// Whether this code's panel report should carry the transcript.
    /// Only the four intent-bearing outcomes do.
    pub fn attaches_transcript(&self) -> bool {
        matches!(
            self,
            ResultCode::ConnectedToOperator
                | ResultCode::NotInterested
                | ResultCode::Disconnected
                | ResultCode::Unknown
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

impl FromStr for ResultCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "connected_to_operator" => ResultCode::ConnectedToOperator,
            "not_interested" => ResultCode::NotInterested,
            "disconnected" => ResultCode::Disconnected,
            "unknown" => ResultCode::Unknown,
            "hangup" => ResultCode::Hangup,
            "missed" => ResultCode::Missed,
            "user_didnt_answer" => ResultCode::UserDidntAnswer,
            "busy" => ResultCode::Busy,
            "power_off" => ResultCode::PowerOff,
            "banned" => ResultCode::Banned,
            "failed:stt_failure" => ResultCode::Failed(FailReason::SttFailure),
            "failed:vira_quota" => ResultCode::Failed(FailReason::SttQuota),
            "failed:llm_quota" => ResultCode::Failed(FailReason::LlmQuota),
            other => match other.strip_prefix("failed:") {
                Some(detail) => ResultCode::Failed(FailReason::Other(detail.to_string())),
                None => return Err(format!("unknown result code `{other}`")),
            },
        };
        Ok(code)
    }
}

impl Serialize for ResultCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.wire_name())
    }
}

impl<'de> Deserialize<'de> for ResultCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// External status vocabulary of the campaign panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PanelStatus {
    #[serde(rename = "CONNECTED")]
    Connected,
    #[serde(rename = "NOT_INTERESTED")]
    NotInterested,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "HANGUP")]
    Hangup,
    #[serde(rename = "MISSED")]
    Missed,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "POWER_OFF")]
    PowerOff,
    #[serde(rename = "BANNED")]
    Banned,
    #[serde(rename = "FAILED")]
    Failed,
}

impl PanelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PanelStatus::Connected => "CONNECTED",
            PanelStatus::NotInterested => "NOT_INTERESTED",
            PanelStatus::Disconnected => "DISCONNECTED",
            PanelStatus::Unknown => "UNKNOWN",
            PanelStatus::Hangup => "HANGUP",
            PanelStatus::Missed => "MISSED",
            PanelStatus::Busy => "BUSY",
            PanelStatus::PowerOff => "POWER_OFF",
            PanelStatus::Banned => "BANNED",
            PanelStatus::Failed => "FAILED",
        }
    }
}

/// Translate an internal result code into the panel's status.
///
/// `connected_to_operator` is the only code mapping to the success status.
/// `failed:stt_failure` intentionally reports as `NOT_INTERESTED` — the
/// campaign treats an unusable reply as a soft negative, not a system
/// fault — while other failures report as `FAILED`.
pub fn translate(code: &ResultCode) -> PanelStatus {
    match code {
        ResultCode::ConnectedToOperator => PanelStatus::Connected,
        ResultCode::NotInterested => PanelStatus::NotInterested,
        ResultCode::Disconnected => PanelStatus::Disconnected,
        ResultCode::Unknown => PanelStatus::Unknown,
        ResultCode::Hangup => PanelStatus::Hangup,
        ResultCode::Missed | ResultCode::UserDidntAnswer => PanelStatus::Missed,
        ResultCode::Busy => PanelStatus::Busy,
        ResultCode::PowerOff => PanelStatus::PowerOff,
        ResultCode::Banned => PanelStatus::Banned,
        ResultCode::Failed(FailReason::SttFailure) => PanelStatus::NotInterested,
        ResultCode::Failed(_) => PanelStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_codes() -> Vec<ResultCode> {
        vec![
            ResultCode::ConnectedToOperator,
            ResultCode::NotInterested,
            ResultCode::Disconnected,
            ResultCode::Unknown,
            ResultCode::Hangup,
            ResultCode::Missed,
            ResultCode::UserDidntAnswer,
            ResultCode::Busy,
            ResultCode::PowerOff,
            ResultCode::Banned,
            ResultCode::Failed(FailReason::SttFailure),
            ResultCode::Failed(FailReason::SttQuota),
            ResultCode::Failed(FailReason::LlmQuota),
            ResultCode::Failed(FailReason::Other("boom".into())),
        ]
    }

    #[test]
    fn mapping_is_total() {
        for code in all_codes() {
            // Every code yields a status without panicking.
            let _ = translate(&code);
        }
    }

    #[test]
    fn only_connected_maps_to_success() {
        for code in all_codes() {
            let status = translate(&code);
            assert_eq!(
                status == PanelStatus::Connected,
                code == ResultCode::ConnectedToOperator,
                "{code:?}"
            );
        }
    }

    #[test]
    fn sip_cause_table() {
        assert_eq!(ResultCode::from_sip_cause(17), ResultCode::Busy);
        for cause in [18, 19, 20] {
            assert_eq!(ResultCode::from_sip_cause(cause), ResultCode::PowerOff);
        }
        for cause in [21, 34, 41, 42] {
            assert_eq!(ResultCode::from_sip_cause(cause), ResultCode::Banned);
        }
        assert_eq!(ResultCode::from_sip_cause(16), ResultCode::Missed);
        assert_eq!(ResultCode::from_sip_cause(1), ResultCode::Missed);
    }

    #[test]
    fn stt_failure_reports_not_interested_without_transcript() {
        let code = ResultCode::Failed(FailReason::SttFailure);
        assert_eq!(translate(&code), PanelStatus::NotInterested);
        assert!(!code.attaches_transcript());
    }

    #[test]
    fn codes_round_trip_through_strings() {
        for code in all_codes() {
            let parsed: ResultCode = code.to_string().parse().unwrap();
            assert_eq!(parsed, code);
        }
    }

    #[test]
    fn transcript_rule_matches_table() {
        for code in all_codes() {
            let expected = matches!(
                code,
                ResultCode::ConnectedToOperator
                    | ResultCode::NotInterested
                    | ResultCode::Disconnected
                    | ResultCode::Unknown
            );
            assert_eq!(code.attaches_transcript(), expected, "{code:?}");
        }
    }
}
