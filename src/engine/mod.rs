//! Detection engine module
//!
//! Loads behavioral rules from a rule directory and checks normalized
//! process events against every loaded rule.

mod condition;
mod rule;
mod selection;

pub use condition::{glob_match, Condition, NamePattern};
pub use rule::{Rule, RuleStore, DEFAULT_LEVEL};
pub use selection::{check_value, FieldMatcher, Modifier, Selection};

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use tracing::trace;

use crate::models::{EventRecord, Match};

const TARGET_ENGINE: &str = "engine";

/// Rule matching engine over a read-only rule store
#[derive(Debug, Default)]
pub struct Engine {
    store: RuleStore,
}

impl Engine {
    pub fn new(store: RuleStore) -> Self {
        Self { store }
    }

    /// Load rules from a directory (recursively scans subdirectories)
    pub fn from_dir<P: AsRef<Path>>(rules_dir: P) -> Result<Self> {
        Ok(Self::new(RuleStore::load_dir(rules_dir)?))
    }

    /// Every rule matching the event, in rule-store order
    pub fn evaluate(&self, event: &EventRecord) -> Vec<Match> {
        let matches: Vec<Match> = self
            .store
            .rules()
            .iter()
            .filter(|rule| rule.matches(event))
            .map(|rule| Match {
                title: rule.title.clone(),
                rule_id: rule.id.clone(),
                level: rule.level.clone(),
                description: rule.description.clone(),
                location: event.location(),
            })
            .collect();

        trace!(
            target: TARGET_ENGINE,
            event_id = ?event.event_id(),
            matches = matches.len(),
            "Event evaluated"
        );
        matches
    }

    pub fn rules(&self) -> &[Rule] {
        self.store.rules()
    }

    /// Get statistics about loaded rules
    pub fn stats(&self) -> EngineStats {
        let mut rules_by_level = BTreeMap::new();
        for rule in self.store.rules() {
            *rules_by_level
                .entry(rule.level.to_ascii_lowercase())
                .or_insert(0) += 1;
        }
        EngineStats {
            total_rules: self.store.len(),
            rules_by_level,
            failed_rules: self.store.failed_rules().to_vec(),
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub total_rules: usize,
    pub rules_by_level: BTreeMap<String, usize>,
    pub failed_rules: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_from(yamls: &[&str]) -> Engine {
        let rules = yamls
            .iter()
            .enumerate()
            .map(|(i, yaml)| Rule::from_yaml(yaml, &format!("rule{}", i)).unwrap())
            .collect();
        Engine::new(RuleStore::from_rules(rules))
    }

    fn powershell_event(command_line: &str) -> EventRecord {
        EventRecord::new()
            .with("EventID", "1")
            .with("Image", "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe")
            .with("CommandLine", command_line)
            .with("ProcessId", "4242")
    }

    #[test]
    fn test_engine_creation() {
        let engine = Engine::default();
        assert_eq!(engine.stats().total_rules, 0);
        assert!(engine.evaluate(&powershell_event("x")).is_empty());
    }

    #[test]
    fn test_event_matching() {
        let engine = engine_from(&[
            "title: Encoded\nlevel: high\ndetection:\n  selection:\n    CommandLine|contains: ['-e ', '-enc']\n  condition: selection\n",
            "title: Whoami\ndetection:\n  selection:\n    Image|endswith: '\\whoami.exe'\n  condition: selection\n",
        ]);

        let matches = engine.evaluate(&powershell_event("powershell -ENC AAA"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].title, "Encoded");
        assert_eq!(matches[0].level, "high");
        assert_eq!(
            matches[0].location,
            "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe"
        );

        assert!(engine.evaluate(&powershell_event("powershell -x")).is_empty());
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let engine = engine_from(&[
            "title: A\ndetection:\n  s:\n    Image: '*powershell.exe'\n  condition: s\n",
            "title: B\ndetection:\n  s1:\n    User: nobody\n  s2:\n    CommandLine|contains: iex\n  condition: 1 of s*\n",
            "title: C\nlevel: critical\ndetection:\n  s:\n    EventID: 1\n  condition: s\n",
        ]);
        let event = powershell_event("powershell iex (foo)");
        let first = engine.evaluate(&event);
        let second = engine.evaluate(&event);
        assert_eq!(first, second);
        let titles: Vec<&str> = first.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_one_of_selection_glob() {
        let engine = engine_from(&[
            "title: Q\ndetection:\n  selection1:\n    Image|endswith: 'cmd.exe'\n  selection2:\n    CommandLine|contains: '-enc'\n  condition: 1 of selection*\n",
        ]);
        assert_eq!(engine.evaluate(&powershell_event("powershell -enc x")).len(), 1);
    }

    #[test]
    fn test_missing_field_is_false_not_error() {
        let engine = engine_from(&[
            "title: P\ndetection:\n  selection:\n    ParentImage|endswith: 'winword.exe'\n  condition: selection\n",
        ]);
        assert!(engine.evaluate(&powershell_event("x")).is_empty());
    }

    #[test]
    fn test_location_falls_back_to_command_line() {
        let engine = engine_from(&[
            "title: L\ndetection:\n  s:\n    CommandLine|contains: evil\n  condition: s\n",
        ]);
        let event = EventRecord::new().with("CommandLine", "evil --now");
        assert_eq!(engine.evaluate(&event)[0].location, "evil --now");
    }

    #[test]
    fn test_stats_by_level() {
        let engine = engine_from(&[
            "title: A\ndetection:\n  s:\n    Image: x\n  condition: s\n",
            "title: B\nlevel: HIGH\ndetection:\n  s:\n    Image: x\n  condition: s\n",
        ]);
        let stats = engine.stats();
        assert_eq!(stats.total_rules, 2);
        assert_eq!(stats.rules_by_level.get("low"), Some(&1));
        assert_eq!(stats.rules_by_level.get("high"), Some(&1));
        assert!(stats.failed_rules.is_empty());
    }
}
