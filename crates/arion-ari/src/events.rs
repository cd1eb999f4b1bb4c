//! Typed model of the ARI event stream
//!
//! The telephony server delivers channel, playback, recording and dial
//! events as JSON objects discriminated by a `type` field. Only the kinds
//! the engine reacts to are modelled; anything else decodes to
//! [`AriEvent::Unknown`] and is dropped by the consumer after logging.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AriError, Result};

/// A channel (one telephony leg) as reported inside events.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Textual channel state as reported by the server
    /// (`Down`, `Ring`, `Ringing`, `Up`, `Busy`, ...).
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: CallerId,
    #[serde(default)]
    pub dialplan: Dialplan,
}

/// Dialplan position of a channel; `exten` carries the dialled number
/// for inbound legs.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Dialplan {
    #[serde(default)]
    pub exten: String,
}

/// Caller identity attached to a channel.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// A playback handle as reported inside playback events.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Playback {
    pub id: String,
    #[serde(default)]
    pub media_uri: String,
    #[serde(default)]
    pub target_uri: String,
}

/// A live recording as reported inside recording events.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LiveRecording {
    pub name: String,
    #[serde(default)]
    pub format: String,
    /// Failure cause, present on RecordingFailed.
    #[serde(default)]
    pub cause: Option<String>,
}

/// Recognised event kinds from the telephony server.
#[derive(Debug, Clone, PartialEq)]
pub enum AriEvent {
    /// A channel entered the application (new inbound leg, or an
    /// originated outbound leg reaching the app).
    StasisStart { channel: Channel, args: Vec<String> },
    /// A channel left the application.
    StasisEnd { channel: Channel },
    /// Channel state moved (ringing, answered, ...).
    ChannelStateChange { channel: Channel },
    /// A hangup was requested on the channel; carries the SIP cause when known.
    ChannelHangupRequest { channel: Channel, cause: Option<u32> },
    /// The channel is gone; carries the SIP cause when known.
    ChannelDestroyed { channel: Channel, cause: Option<u32> },
    /// Playback started on a channel or bridge.
    PlaybackStarted { playback: Playback },
    /// Playback ran to completion (or was stopped).
    PlaybackFinished { playback: Playback },
    /// A recording completed and its file is available.
    RecordingFinished { recording: LiveRecording },
    /// The recording subsystem failed.
    RecordingFailed { recording: LiveRecording },
    /// Pre-answer dial progress on an originated channel; `dialstatus` is
    /// the server's dial disposition and `cause` the SIP cause when present.
    Dial {
        peer: Channel,
        dialstatus: String,
        cause: Option<u32>,
    },
    /// Any event kind the engine does not react to.
    Unknown { kind: String },
}

impl AriEvent {
    /// Decode one event-stream message.
    ///
    /// Unknown `type` tags are not an error; they decode to
    /// [`AriEvent::Unknown`] so the consumer can log and drop them without
    /// breaking the stream.
    pub fn parse(raw: &str) -> Result<AriEvent> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| AriError::Malformed(format!("event is not JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AriError::Malformed("event has no type field".into()))?
            .to_string();

        fn field<T: serde::de::DeserializeOwned>(value: &Value, name: &str) -> Result<T> {
            let inner = value
                .get(name)
                .cloned()
                .ok_or_else(|| AriError::Malformed(format!("event missing `{name}`")))?;
            serde_json::from_value(inner)
                .map_err(|e| AriError::Malformed(format!("bad `{name}` payload: {e}")))
        }

        let event = match kind.as_str() {
            "StasisStart" => AriEvent::StasisStart {
                channel: field(&value, "channel")?,
                args: field(&value, "args").unwrap_or_default(),
            },
            "StasisEnd" => AriEvent::StasisEnd {
                channel: field(&value, "channel")?,
            },
            "ChannelStateChange" => AriEvent::ChannelStateChange {
                channel: field(&value, "channel")?,
            },
            "ChannelHangupRequest" => AriEvent::ChannelHangupRequest {
                channel: field(&value, "channel")?,
                cause: value.get("cause").and_then(Value::as_u64).map(|c| c as u32),
            },
            "ChannelDestroyed" => AriEvent::ChannelDestroyed {
                channel: field(&value, "channel")?,
                cause: value.get("cause").and_then(Value::as_u64).map(|c| c as u32),
            },
            "PlaybackStarted" => AriEvent::PlaybackStarted {
                playback: field(&value, "playback")?,
            },
            "PlaybackFinished" => AriEvent::PlaybackFinished {
                playback: field(&value, "playback")?,
            },
            "RecordingFinished" => AriEvent::RecordingFinished {
                recording: field(&value, "recording")?,
            },
            "RecordingFailed" => AriEvent::RecordingFailed {
                recording: field(&value, "recording")?,
            },
            "Dial" => AriEvent::Dial {
                peer: field(&value, "peer")?,
                dialstatus: value
                    .get("dialstatus")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                cause: value
                    .get("cause")
                    .and_then(Value::as_u64)
                    .or_else(|| {
                        // Some server versions report the cause as a string.
                        value
                            .get("cause")
                            .and_then(Value::as_str)
                            .and_then(|s| s.parse().ok())
                    })
                    .map(|c| c as u32),
            },
            _ => AriEvent::Unknown { kind },
        };
        Ok(event)
    }

    /// The channel id this event refers to, when it refers to one.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            AriEvent::StasisStart { channel, .. }
            | AriEvent::StasisEnd { channel }
            | AriEvent::ChannelStateChange { channel }
            | AriEvent::ChannelHangupRequest { channel, .. }
            | AriEvent::ChannelDestroyed { channel, .. } => Some(&channel.id),
            AriEvent::Dial { peer, .. } => Some(&peer.id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stasis_start() {
        let raw = r#"{
            "type": "StasisStart",
            "args": ["outbound"],
            "channel": {
                "id": "1718000000.42",
                "name": "PJSIP/trunk-00000042",
                "state": "Ring",
                "caller": {"name": "", "number": "09123456789"}
            }
        }"#;
        match AriEvent::parse(raw).unwrap() {
            AriEvent::StasisStart { channel, args } => {
                assert_eq!(channel.id, "1718000000.42");
                assert_eq!(channel.caller.number, "09123456789");
                assert_eq!(args, vec!["outbound".to_string()]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_hangup_cause() {
        let raw = r#"{"type":"ChannelHangupRequest","cause":17,
                      "channel":{"id":"c1","name":"","state":"Up"}}"#;
        match AriEvent::parse(raw).unwrap() {
            AriEvent::ChannelHangupRequest { cause, .. } => assert_eq!(cause, Some(17)),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_dial_with_string_cause() {
        let raw = r#"{"type":"Dial","dialstatus":"BUSY","cause":"17",
                      "peer":{"id":"c9","name":"","state":"Down"}}"#;
        match AriEvent::parse(raw).unwrap() {
            AriEvent::Dial {
                dialstatus, cause, ..
            } => {
                assert_eq!(dialstatus, "BUSY");
                assert_eq!(cause, Some(17));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_kinds_are_tolerated() {
        let raw = r#"{"type":"ChannelVarset","variable":"X","value":"1"}"#;
        assert_eq!(
            AriEvent::parse(raw).unwrap(),
            AriEvent::Unknown {
                kind: "ChannelVarset".into()
            }
        );
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(AriEvent::parse(r#"{"channel":{"id":"x"}}"#).is_err());
    }

    #[test]
    fn playback_events_carry_ids() {
        let raw = r#"{"type":"PlaybackFinished",
                      "playback":{"id":"pb-1","media_uri":"sound:custom/hello"}}"#;
        match AriEvent::parse(raw).unwrap() {
            AriEvent::PlaybackFinished { playback } => {
                assert_eq!(playback.id, "pb-1");
                assert_eq!(playback.media_uri, "sound:custom/hello");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
