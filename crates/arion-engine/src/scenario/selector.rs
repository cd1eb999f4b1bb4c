//! Scenario selection
//!
//! Outbound calls rotate round-robin over the scenarios the panel marked
//! active, intersected with what is actually loaded; inbound calls rotate
//! independently over the scenarios that declare an inbound flow. With the
//! panel disabled, the outbound rotation covers everything loaded.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::model::Scenario;

#[derive(Default)]
struct Cursors {
    /// Panel-advertised active set: (panel id, scenario name).
    active: Vec<(i64, String)>,
    outbound: usize,
    inbound: usize,
}

/// All loaded scenarios plus the two rotation cursors.
pub struct ScenarioBook {
    loaded: HashMap<String, Arc<Scenario>>,
    /// Deterministic rotation orders, fixed at load time.
    all_names: Vec<String>,
    inbound_names: Vec<String>,
    cursors: Mutex<Cursors>,
}

impl ScenarioBook {
    pub fn new(scenarios: HashMap<String, Scenario>) -> Self {
        let loaded: HashMap<String, Arc<Scenario>> = scenarios
            .into_iter()
            .map(|(name, scenario)| (name, Arc::new(scenario)))
            .collect();
        let mut all_names: Vec<String> = loaded.keys().cloned().collect();
        all_names.sort();
        let mut inbound_names: Vec<String> = loaded
            .values()
            .filter(|s| s.has_inbound_flow())
            .map(|s| s.name.clone())
            .collect();
        inbound_names.sort();
        Self {
            loaded,
            all_names,
            inbound_names,
            cursors: Mutex::new(Cursors::default()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Scenario>> {
        self.loaded.get(name).cloned()
    }

    /// Names and display names for startup registration with the panel.
    pub fn registration_list(&self) -> Vec<(String, String)> {
        self.all_names
            .iter()
            .map(|name| {
                let scenario = &self.loaded[name];
                let display = if scenario.display_name.is_empty() {
                    scenario.name.clone()
                } else {
                    scenario.display_name.clone()
                };
                (scenario.name.clone(), display)
            })
            .collect()
    }

    /// Adopt the active set from the latest panel batch. Names the panel
    /// advertises but we never loaded are logged and skipped.
    pub fn set_active(&self, active: Vec<(i64, String)>) {
        let mut known = Vec::with_capacity(active.len());
        for (id, name) in active {
            if self.loaded.contains_key(&name) {
                known.push((id, name));
            } else {
                warn!(scenario = %name, "panel activated a scenario that is not loaded");
            }
        }
        let mut cursors = self.cursors.lock();
        cursors.active = known;
        cursors.outbound = 0;
    }

    /// Next scenario for an outbound contact, with its panel id when the
    /// rotation is panel-driven.
    pub fn next_outbound(&self) -> Option<(Arc<Scenario>, Option<i64>)> {
        let mut cursors = self.cursors.lock();
        if cursors.active.is_empty() {
            if self.all_names.is_empty() {
                return None;
            }
            let index = cursors.outbound % self.all_names.len();
            cursors.outbound = cursors.outbound.wrapping_add(1);
            let scenario = self.loaded[&self.all_names[index]].clone();
            return Some((scenario, None));
        }
        let len = cursors.active.len();
        let index = cursors.outbound % len;
        cursors.outbound = cursors.outbound.wrapping_add(1);
        let (panel_id, name) = cursors.active[index].clone();
        Some((self.loaded[&name].clone(), Some(panel_id)))
    }

    /// Next scenario for an inbound call.
    pub fn next_inbound(&self) -> Option<Arc<Scenario>> {
        if self.inbound_names.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock();
        let index = cursors.inbound % self.inbound_names.len();
        cursors.inbound = cursors.inbound.wrapping_add(1);
        Some(self.loaded[&self.inbound_names[index]].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::model::{Flow, LlmSettings, Step, SttSettings};

    fn scenario(name: &str, inbound: bool) -> Scenario {
        let mut steps = HashMap::new();
        steps.insert("entry".to_string(), Step::Disconnect);
        let flow = Flow {
            entry: "entry".into(),
            steps,
        };
        Scenario {
            company: "acme".into(),
            name: name.into(),
            display_name: String::new(),
            prompts: HashMap::new(),
            stt: SttSettings {
                hotwords: vec![],
                max_duration_seconds: 10,
                max_silence_seconds: 3,
            },
            llm: LlmSettings {
                prompt_template: "{transcript}".into(),
                intents: vec!["yes".into()],
                fallback_tokens: HashMap::new(),
            },
            transfer_to_operator: false,
            flow: flow.clone(),
            inbound_flow: inbound.then_some(flow),
        }
    }

    fn book(names: &[(&str, bool)]) -> ScenarioBook {
        ScenarioBook::new(
            names
                .iter()
                .map(|(n, inbound)| (n.to_string(), scenario(n, *inbound)))
                .collect(),
        )
    }

    #[test]
    fn outbound_rotates_over_active_set() {
        let book = book(&[("a", false), ("b", false), ("c", false)]);
        book.set_active(vec![(1, "a".into()), (2, "c".into())]);
        let picks: Vec<String> = (0..4)
            .map(|_| book.next_outbound().unwrap().0.name.clone())
            .collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn unknown_active_names_are_skipped() {
        let book = book(&[("a", false)]);
        book.set_active(vec![(1, "ghost".into()), (2, "a".into())]);
        let (scenario, panel_id) = book.next_outbound().unwrap();
        assert_eq!(scenario.name, "a");
        assert_eq!(panel_id, Some(2));
    }

    #[test]
    fn no_active_set_rotates_over_loaded() {
        let book = book(&[("b", false), ("a", false)]);
        let picks: Vec<String> = (0..3)
            .map(|_| book.next_outbound().unwrap().0.name.clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a"]);
    }

    #[test]
    fn inbound_cursor_is_independent() {
        let book = book(&[("a", true), ("b", false), ("c", true)]);
        book.set_active(vec![(1, "b".into())]);
        assert_eq!(book.next_inbound().unwrap().name, "a");
        assert_eq!(book.next_outbound().unwrap().0.name, "b");
        assert_eq!(book.next_inbound().unwrap().name, "c");
        assert_eq!(book.next_inbound().unwrap().name, "a");
    }

    #[test]
    fn no_inbound_scenarios_yields_none() {
        let book = book(&[("a", false)]);
        assert!(book.next_inbound().is_none());
    }
}
