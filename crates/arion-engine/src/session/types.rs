//! Session state
//!
//! A session is the application-level record of one prospect interaction:
//! one customer leg, an optional operator leg, exactly one mixing bridge
//! while alive, a flow cursor and the result bookkeeping. All mutation
//! goes through the session's async mutex; the table-level maps in the
//! engine only resolve ids to handles.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::signals::Waiters;
use crate::agents::{Agent, AgentKind};
use crate::lines::{Direction, Line};
use crate::results::{PanelStatus, ResultCode};
use crate::scenario::Scenario;

/// Internally generated session identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one telephony leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Created,
    Ringing,
    Answered,
    Hungup,
    Failed,
}

impl LegState {
    pub fn is_live(&self) -> bool {
        !matches!(self, LegState::Hungup | LegState::Failed)
    }

    /// Map the server's textual channel state.
    pub fn from_channel_state(state: &str) -> Option<LegState> {
        match state {
            "Up" => Some(LegState::Answered),
            "Ring" | "Ringing" => Some(LegState::Ringing),
            "Down" => Some(LegState::Created),
            _ => None,
        }
    }
}

/// One telephony leg of a session.
#[derive(Debug, Clone)]
pub struct Leg {
    pub channel_id: String,
    pub state: LegState,
    pub number: String,
    pub caller_id: String,
    pub start_ts: DateTime<Local>,
}

impl Leg {
    pub fn new(channel_id: String, number: String, caller_id: String) -> Self {
        Self {
            channel_id,
            state: LegState::Created,
            number,
            caller_id,
            start_ts: Local::now(),
        }
    }
}

/// Timing marks collected over a session's life.
#[derive(Debug, Clone, Default)]
pub struct Timing {
    pub answered_at: Option<DateTime<Local>>,
    pub yes_at: Option<DateTime<Local>>,
    pub operator_connected_at: Option<DateTime<Local>>,
}

/// Mutable session state, guarded by the handle's mutex.
pub struct Session {
    pub id: SessionId,
    pub direction: Direction,
    pub scenario: Arc<Scenario>,
    pub scenario_panel_id: Option<i64>,
    pub line: Arc<Line>,
    /// Panel contact id for outbound attempts.
    pub contact_id: Option<i64>,
    /// Normalized customer number.
    pub customer_number: String,
    pub customer_leg: Leg,
    pub operator_leg: Option<Leg>,
    /// The operator currently assigned (with the roster it came from), if
    /// a transfer is in progress or completed. Its busy flag is released
    /// on failure paths immediately and at cleanup otherwise.
    pub agent: Option<(AgentKind, Agent)>,
    pub bridge_id: Option<String>,
    /// Flow cursor: id of the step currently executing.
    pub cursor: String,
    /// Per-session counters backing `check_retry_limit`.
    pub counters: HashMap<String, u32>,
    pub transcript: Option<String>,
    pub intent: Option<String>,
    pub result: Option<ResultCode>,
    /// Statuses already reported to the panel; used for de-duplication.
    pub reported: HashSet<PanelStatus>,
    /// SIP cause captured from pre-answer Dial/Hangup events.
    pub pending_cause: Option<u32>,
    /// Sequence for recording names within the session.
    pub recording_seq: u32,
    pub timing: Timing,
    /// Guards against starting the scenario task twice when both the
    /// stasis and state-change events report the answer.
    pub flow_started: bool,
    /// Whether this session holds a slot in its line's counters.
    pub line_counted: bool,
    pub cleanup_done: bool,
}

impl Session {
    pub fn answered(&self) -> bool {
        self.timing.answered_at.is_some()
    }

    /// Record a terminal result. Later transitions may overwrite; the
    /// reporter de-duplicates per mapped status.
    pub fn set_result(&mut self, code: ResultCode) {
        self.result = Some(code);
    }

    pub fn next_recording_name(&mut self) -> String {
        self.recording_seq += 1;
        format!("{}-{}", self.id, self.recording_seq)
    }
}

/// Shared handle to one session: the state mutex, the event waiters and
/// the cancellation token that tears the flow down on hangup or shutdown.
pub struct SessionHandle {
    pub id: SessionId,
    pub state: Mutex<Session>,
    pub waiters: Waiters,
    pub cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            id: session.id.clone(),
            state: Mutex::new(session),
            waiters: Waiters::default(),
            cancel: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_states_map() {
        assert_eq!(LegState::from_channel_state("Up"), Some(LegState::Answered));
        assert_eq!(
            LegState::from_channel_state("Ringing"),
            Some(LegState::Ringing)
        );
        assert_eq!(LegState::from_channel_state("Weird"), None);
    }

    #[test]
    fn live_states() {
        assert!(LegState::Answered.is_live());
        assert!(LegState::Created.is_live());
        assert!(!LegState::Hungup.is_live());
        assert!(!LegState::Failed.is_live());
    }
}
