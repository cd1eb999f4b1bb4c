//! Scenario loading and validation
//!
//! Scenarios are YAML files in `SCENARIOS_DIR` (`*.yaml` / `*.yml`), one
//! scenario per file. Structural validation happens at load time so a bad
//! edge is an operator-facing startup error naming the file and step, not
//! a mid-call surprise.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::info;

use super::model::{Flow, Scenario, Step};
use crate::error::{EngineError, Result};

/// Load every scenario in a directory, keyed by name.
pub fn load_dir(dir: &Path) -> Result<HashMap<String, Scenario>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        EngineError::scenario(format!("cannot read scenarios dir {}: {e}", dir.display()))
    })?;

    let mut scenarios = HashMap::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| EngineError::scenario(format!("reading {}: {e}", dir.display())))?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        let scenario = load_file(&path)?;
        info!(
            scenario = %scenario.name,
            company = %scenario.company,
            inbound = scenario.has_inbound_flow(),
            "scenario loaded"
        );
        if let Some(previous) = scenarios.insert(scenario.name.clone(), scenario) {
            return Err(EngineError::scenario(format!(
                "duplicate scenario name `{}` in {}",
                previous.name,
                dir.display()
            )));
        }
    }
    if scenarios.is_empty() {
        return Err(EngineError::scenario(format!(
            "no scenarios found in {}",
            dir.display()
        )));
    }
    Ok(scenarios)
}

/// Load and validate a single scenario file.
pub fn load_file(path: &Path) -> Result<Scenario> {
    let raw = fs::read_to_string(path)
        .map_err(|e| EngineError::scenario(format!("cannot read {}: {e}", path.display())))?;
    let scenario: Scenario = serde_yaml::from_str(&raw)
        .map_err(|e| EngineError::scenario(format!("{}: {e}", path.display())))?;
    validate(&scenario).map_err(|e| match e {
        EngineError::Scenario(msg) => EngineError::scenario(format!("{}: {msg}", path.display())),
        other => other,
    })?;
    Ok(scenario)
}

/// Structural validation of a scenario definition.
pub fn validate(scenario: &Scenario) -> Result<()> {
    validate_flow(scenario, &scenario.flow, "flow")?;
    if let Some(inbound) = &scenario.inbound_flow {
        validate_flow(scenario, inbound, "inbound_flow")?;
    }
    if !scenario.llm.prompt_template.contains("{transcript}") {
        return Err(EngineError::scenario(
            "llm.prompt_template has no {transcript} placeholder",
        ));
    }
    Ok(())
}

fn validate_flow(scenario: &Scenario, flow: &Flow, which: &str) -> Result<()> {
    if !flow.steps.contains_key(&flow.entry) {
        return Err(EngineError::scenario(format!(
            "{which}: entry step `{}` does not exist",
            flow.entry
        )));
    }
    for (id, step) in &flow.steps {
        for target in step.targets() {
            if !flow.steps.contains_key(target) {
                return Err(EngineError::scenario(format!(
                    "{which}: step `{id}` references missing step `{target}`"
                )));
            }
        }
        if let Step::PlayPrompt { prompt, .. } = step {
            if scenario.prompt(prompt).is_none() {
                return Err(EngineError::scenario(format!(
                    "{which}: step `{id}` plays unknown prompt `{prompt}`"
                )));
            }
        }
        if let Step::RouteByIntent { routes } = step {
            for intent in routes.keys() {
                if intent != "unknown" && !scenario.llm.intents.contains(intent) {
                    return Err(EngineError::scenario(format!(
                        "{which}: step `{id}` routes undeclared intent `{intent}`"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const GOOD: &str = r#"
company: acme
name: salehi
display_name: "Salehi campaign"
transfer_to_operator: false
prompts:
  hello: sound:custom/hello
  yes_prompt: sound:custom/yes
  goodby: sound:custom/goodby
stt:
  hotwords: ["بیمه"]
  max_duration_seconds: 10
  max_silence_seconds: 3
llm:
  prompt_template: "Answer with one word. Caller said: {transcript}"
  intents: ["yes", "no", "number_question"]
  fallback_tokens:
    "yes": ["بله"]
flow:
  steps:
    entry: { kind: entry, next: greet }
    greet: { kind: play_prompt, prompt: hello, next: listen }
    listen: { kind: record, next: classify, on_empty: bye, on_failure: bye }
    classify: { kind: classify_intent, next: branch, on_failure: bye }
    branch:
      kind: route_by_intent
      routes: { "yes": accept, "no": bye, unknown: bye }
    accept: { kind: set_result, result: connected_to_operator, next: play_yes }
    play_yes: { kind: play_prompt, prompt: yes_prompt, next: done }
    bye: { kind: play_prompt, prompt: goodby, next: done }
    done: { kind: disconnect }
"#;

    fn write_scenario(dir: &Path, name: &str, body: &str) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn loads_valid_scenario() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "salehi.yaml", GOOD);
        let scenarios = load_dir(dir.path()).unwrap();
        assert!(scenarios.contains_key("salehi"));
        assert_eq!(scenarios["salehi"].prompts.len(), 3);
    }

    #[test]
    fn rejects_dangling_edge() {
        let broken = GOOD.replace("next: listen", "next: nowhere");
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "bad.yaml", &broken);
        let err = load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("nowhere"), "{err}");
    }

    #[test]
    fn rejects_unknown_prompt() {
        let broken = GOOD.replace("prompt: hello", "prompt: missing");
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "bad.yaml", &broken);
        assert!(load_dir(dir.path()).is_err());
    }

    #[test]
    fn rejects_template_without_placeholder() {
        let broken = GOOD.replace("{transcript}", "nothing");
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "bad.yaml", &broken);
        assert!(load_dir(dir.path()).is_err());
    }

    #[test]
    fn ignores_non_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        write_scenario(dir.path(), "salehi.yaml", GOOD);
        write_scenario(dir.path(), "notes.txt", "not yaml");
        assert_eq!(load_dir(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_dir(dir.path()).is_err());
    }
}
