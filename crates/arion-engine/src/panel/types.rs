//! Campaign panel wire types
//!
//! Field names here are the panel's exact contract; renaming any of them
//! breaks the integration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::results::PanelStatus;

/// One contact to dial.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub phone_number: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A scenario the panel wants in the rotation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ActiveScenario {
    pub id: i64,
    pub name: String,
}

/// An outbound line as the panel knows it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PanelLine {
    pub id: i64,
    pub phone_number: String,
    #[serde(default)]
    pub display_name: String,
}

/// A live operator.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PanelAgent {
    pub id: i64,
    pub phone_number: String,
}

/// Response of the next-batch RPC.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Batch {
    pub call_allowed: bool,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub active_scenarios: Vec<ActiveScenario>,
    #[serde(default)]
    pub outbound_lines: Vec<PanelLine>,
    #[serde(default)]
    pub inbound_agents: Vec<PanelAgent>,
    #[serde(default)]
    pub outbound_agents: Vec<PanelAgent>,
}

/// One per-call result report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CallReport {
    pub company: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_id: Option<i64>,
    pub phone_number: String,
    pub status: PanelStatus,
    pub reason: String,
    /// ISO-8601 local timestamp of the attempt.
    pub attempted_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_line_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_contract_fields() {
        let report = CallReport {
            company: "acme".into(),
            number_id: Some(42),
            phone_number: "09123456789".into(),
            status: PanelStatus::Connected,
            reason: "connected_to_operator".into(),
            attempted_at: "2026-08-01T10:00:00".into(),
            scenario_id: None,
            outbound_line_id: Some(7),
            agent_id: None,
            agent_phone: None,
            user_message: Some("بله حتما".into()),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "CONNECTED");
        assert_eq!(json["number_id"], 42);
        assert_eq!(json["outbound_line_id"], 7);
        assert!(json.get("agent_id").is_none());
        assert_eq!(json["user_message"], "بله حتما");
    }

    #[test]
    fn batch_tolerates_missing_sections() {
        let batch: Batch = serde_json::from_str(r#"{"call_allowed": true}"#).unwrap();
        assert!(batch.call_allowed);
        assert!(batch.contacts.is_empty());
    }
}
