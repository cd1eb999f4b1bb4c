//! Declarative call-flow model
//!
//! A scenario couples prompt media references, STT/LLM settings and one or
//! two flow graphs (outbound, optional inbound). Flows are directed graphs
//! of [`Step`] nodes keyed by step id; every transition is an explicit
//! edge, there is no implicit fallthrough.

use std::collections::HashMap;

use serde::Deserialize;

use crate::results::ResultCode;

/// STT settings carried by each scenario.
#[derive(Debug, Clone, Deserialize)]
pub struct SttSettings {
    #[serde(default)]
    pub hotwords: Vec<String>,
    pub max_duration_seconds: u32,
    pub max_silence_seconds: u32,
}

/// LLM settings carried by each scenario.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSettings {
    /// Classification prompt with a `{transcript}` placeholder.
    pub prompt_template: String,
    /// The closed intent category set the model must answer from.
    pub intents: Vec<String>,
    /// Per-intent substrings for fallback classification when the LLM is
    /// unreachable.
    #[serde(default)]
    pub fallback_tokens: HashMap<String, Vec<String>>,
}

/// One node of a flow graph.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// No-op entry point.
    Entry { next: String },
    /// Play a prompt on the session bridge and wait for it to finish.
    PlayPrompt {
        prompt: String,
        next: String,
        #[serde(default)]
        on_failure: Option<String>,
    },
    /// Record the caller's reply.
    Record {
        next: String,
        on_empty: String,
        on_failure: String,
    },
    /// Transcribe and classify the last recording.
    ClassifyIntent { next: String, on_failure: String },
    /// Branch on the classified intent.
    RouteByIntent { routes: HashMap<String, String> },
    /// Write the terminal result and continue.
    SetResult { result: ResultCode, next: String },
    /// Bridge the caller to a live operator.
    TransferToOperator {
        #[serde(default = "default_agent_type")]
        agent_type: String,
        on_success: String,
        on_failure: String,
    },
    /// Hang up the customer and end the flow.
    Disconnect,
    /// Alias of disconnect kept for flows authored against older engines.
    Hangup,
    /// Park until an external event (normally a hangup) ends the session.
    Wait,
    /// Bounded loop: increment a per-session counter and branch.
    CheckRetryLimit {
        counter: String,
        limit: u32,
        over: String,
        under: String,
    },
}

fn default_agent_type() -> String {
    "outbound".into()
}

impl Step {
    /// Step ids this step can transition to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Step::Entry { next } => vec![next],
            Step::PlayPrompt {
                next, on_failure, ..
            } => {
                let mut targets = vec![next.as_str()];
                if let Some(f) = on_failure {
                    targets.push(f);
                }
                targets
            }
            Step::Record {
                next,
                on_empty,
                on_failure,
            } => vec![next, on_empty, on_failure],
            Step::ClassifyIntent { next, on_failure } => vec![next, on_failure],
            Step::RouteByIntent { routes } => routes.values().map(String::as_str).collect(),
            Step::SetResult { next, .. } => vec![next],
            Step::TransferToOperator {
                on_success,
                on_failure,
                ..
            } => vec![on_success, on_failure],
            Step::CheckRetryLimit { over, under, .. } => vec![over, under],
            Step::Disconnect | Step::Hangup | Step::Wait => vec![],
        }
    }
}

/// A flow graph with its entry node.
#[derive(Debug, Clone, Deserialize)]
pub struct Flow {
    #[serde(default = "default_entry")]
    pub entry: String,
    pub steps: HashMap<String, Step>,
}

fn default_entry() -> String {
    "entry".into()
}

/// A complete scenario definition. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub company: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    /// Prompt key → media reference understood by the telephony server,
    /// e.g. `sound:custom/hello`.
    pub prompts: HashMap<String, String>,
    pub stt: SttSettings,
    pub llm: LlmSettings,
    /// Whether a YES branch transfers to an operator rather than just
    /// concluding the call.
    #[serde(default)]
    pub transfer_to_operator: bool,
    pub flow: Flow,
    #[serde(default)]
    pub inbound_flow: Option<Flow>,
}

impl Scenario {
    pub fn prompt(&self, key: &str) -> Option<&str> {
        self.prompts.get(key).map(String::as_str)
    }

    pub fn has_inbound_flow(&self) -> bool {
        self.inbound_flow.is_some()
    }

    /// Fallback classification over the scenario's token lists: first
    /// category in declared intent order whose tokens substring-match wins.
    pub fn classify_by_tokens(&self, transcript: &str) -> String {
        for intent in &self.llm.intents {
            if let Some(tokens) = self.llm.fallback_tokens.get(intent) {
                if tokens.iter().any(|token| transcript.contains(token.as_str())) {
                    return intent.clone();
                }
            }
        }
        "unknown".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_with_tokens() -> Scenario {
        let yaml = r#"
company: acme
name: demo
prompts:
  hello: sound:custom/hello
stt:
  max_duration_seconds: 10
  max_silence_seconds: 3
llm:
  prompt_template: "Classify: {transcript}"
  intents: ["yes", "no"]
  fallback_tokens:
    "yes": ["بله", "باشه"]
    "no": ["نه"]
flow:
  steps:
    entry: { kind: entry, next: done }
    done: { kind: disconnect }
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn token_fallback_respects_intent_order() {
        let scenario = scenario_with_tokens();
        assert_eq!(scenario.classify_by_tokens("گفت بله حتما"), "yes");
        assert_eq!(scenario.classify_by_tokens("نه ممنون"), "no");
        assert_eq!(scenario.classify_by_tokens("الو؟"), "unknown");
    }

    #[test]
    fn set_result_deserializes_from_code_string() {
        let step: Step = serde_yaml::from_str(
            r#"{ kind: set_result, result: connected_to_operator, next: done }"#,
        )
        .unwrap();
        assert_eq!(
            step,
            Step::SetResult {
                result: ResultCode::ConnectedToOperator,
                next: "done".into()
            }
        );
    }

    #[test]
    fn targets_cover_all_edges() {
        let step = Step::Record {
            next: "a".into(),
            on_empty: "b".into(),
            on_failure: "c".into(),
        };
        assert_eq!(step.targets(), vec!["a", "b", "c"]);
    }
}
