//! Rule model and the directory-backed rule store.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::condition::Condition;
use super::selection::Selection;
use crate::alerts::audit;
use crate::models::EventRecord;

const TARGET_ENGINE: &str = "engine";

/// Level assigned to rules that do not declare one
pub const DEFAULT_LEVEL: &str = "low";

/// Rule file as written on disk
#[derive(Debug, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    detection: Option<Mapping>,
}

/// Compiled detection rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub title: String,
    pub id: Option<String>,
    pub description: Option<String>,
    pub level: String,
    /// Named selections in file order
    pub selections: Vec<(String, Selection)>,
    pub condition: Condition,
    /// Raw condition text, kept for diagnostics
    pub condition_text: String,
}

impl Rule {
    /// Parse a rule from YAML text.
    /// `fallback_title` is used when the document has no title.
    pub fn from_yaml(content: &str, fallback_title: &str) -> Result<Self> {
        let doc: RuleDocument = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        let detection = doc
            .detection
            .ok_or_else(|| anyhow!("rule has no detection block"))?;

        let condition_value = detection
            .get("condition")
            .ok_or_else(|| anyhow!("detection has no condition"))?;
        let condition_text = condition_text(condition_value)?;

        let mut selections = Vec::new();
        for (key, value) in &detection {
            let name = match key {
                Value::String(name) => name.clone(),
                Value::Number(n) => n.to_string(),
                _ => bail!("selection names must be strings"),
            };
            if name == "condition" {
                continue;
            }
            let selection = Selection::compile(value)
                .with_context(|| format!("invalid selection '{}'", name))?;
            selections.push((name, selection));
        }

        let title = doc
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| fallback_title.to_string());
        let condition = compile_condition(&title, &condition_text, &selections);

        Ok(Self {
            title,
            id: doc.id.as_ref().and_then(scalar_text),
            description: doc.description,
            level: doc
                .level
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
            selections,
            condition,
            condition_text,
        })
    }

    /// Evaluate every selection, then fold through the condition.
    /// Rules without selections never match.
    pub fn matches(&self, event: &EventRecord) -> bool {
        if self.selections.is_empty() {
            return false;
        }
        let results: Vec<(String, bool)> = self
            .selections
            .iter()
            .map(|(name, selection)| (name.clone(), selection.matches(event)))
            .collect();
        self.condition.evaluate(&results)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Condition text; a list of conditions is treated as their disjunction
fn condition_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Sequence(items) => {
            let parts = items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(|s| format!("({})", s))
                        .ok_or_else(|| anyhow!("condition list entries must be strings"))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(parts.join(" or "))
        }
        _ => bail!("condition must be a string"),
    }
}

/// Parse the condition; unparseable text or unknown names fall back to
/// "any selection matched".
fn compile_condition(title: &str, text: &str, selections: &[(String, Selection)]) -> Condition {
    let condition = match Condition::parse(text) {
        Ok(condition) => condition,
        Err(err) => {
            warn!(
                target: TARGET_ENGINE,
                rule = %title,
                condition = %text,
                error = %err,
                "Unparseable condition; matching if any selection matches"
            );
            return Condition::fallback();
        }
    };

    let unknown: Vec<&str> = condition
        .referenced_names()
        .into_iter()
        .filter(|name| !selections.iter().any(|(n, _)| n == name))
        .collect();
    if !unknown.is_empty() {
        warn!(
            target: TARGET_ENGINE,
            rule = %title,
            condition = %text,
            unknown = ?unknown,
            "Condition references unknown selections; matching if any selection matches"
        );
        return Condition::fallback();
    }

    condition
}

/// Rules loaded once at startup, plus the files that failed to load
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Vec<Rule>,
    failed_rules: Vec<(String, String)>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            failed_rules: Vec::new(),
        }
    }

    /// Load rules from a directory (recursively scans subdirectories).
    /// A missing directory yields an empty store.
    pub fn load_dir<P: AsRef<Path>>(rules_dir: P) -> Result<Self> {
        let rules_dir = rules_dir.as_ref();
        let mut store = Self::new();

        if !rules_dir.exists() {
            warn!(target: TARGET_ENGINE, "Rules directory does not exist: {:?}", rules_dir);
            return Ok(store);
        }

        info!(target: TARGET_ENGINE, "Loading rules from: {:?} (recursive)", rules_dir);

        let mut files = Vec::new();
        collect_rule_files(rules_dir, &mut files)?;
        files.sort();

        for path in files {
            match store.load_file(&path) {
                Ok(()) => debug!(target: TARGET_ENGINE, "Loaded rule: {:?}", path),
                Err(e) => {
                    let err_msg = format!("{:#}", e);
                    warn!(target: TARGET_ENGINE, "Failed to load rule {:?}: {}", path, err_msg);
                    audit(
                        "ERROR",
                        "Rule load failed",
                        &format!("{}: {}", path.display(), err_msg),
                    );
                    store.failed_rules.push((path.display().to_string(), err_msg));
                }
            }
        }

        info!(
            target: TARGET_ENGINE,
            loaded = store.rules.len(),
            failed = store.failed_rules.len(),
            "Rule loading complete"
        );
        Ok(store)
    }

    fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).context("Failed to read rule file")?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rule = Rule::from_yaml(&content, &stem)?;
        self.rules.push(rule);
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn failed_rules(&self) -> &[(String, String)] {
        &self.failed_rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn collect_rule_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory {:?}", dir))?;

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_rule_files(&path, files)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yml" || ext == "yaml" {
                files.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const POWERSHELL_RULE: &str = r#"
title: Suspicious PowerShell
id: 7f2a1c3e
level: high
detection:
  selection:
    CommandLine|contains: "-enc"
  condition: selection
"#;

    #[test]
    fn test_parse_rule() {
        let rule = Rule::from_yaml(POWERSHELL_RULE, "fallback").unwrap();
        assert_eq!(rule.title, "Suspicious PowerShell");
        assert_eq!(rule.id.as_deref(), Some("7f2a1c3e"));
        assert_eq!(rule.level, "high");
        assert_eq!(rule.selections.len(), 1);
        assert_eq!(rule.condition, Condition::Selection("selection".to_string()));
    }

    #[test]
    fn test_rule_without_condition_is_rejected() {
        let yaml = "title: X\ndetection:\n  selection:\n    Image: a.exe\n";
        assert!(Rule::from_yaml(yaml, "x").is_err());
        assert!(Rule::from_yaml("title: X\n", "x").is_err());
    }

    #[test]
    fn test_defaults() {
        let yaml = "detection:\n  sel:\n    Image: a.exe\n  condition: sel\n";
        let rule = Rule::from_yaml(yaml, "from_file").unwrap();
        assert_eq!(rule.title, "from_file");
        assert_eq!(rule.level, DEFAULT_LEVEL);
        assert!(rule.description.is_none());
    }

    #[test]
    fn test_unknown_selection_falls_back() {
        let yaml = "title: X\ndetection:\n  sel:\n    Image: a.exe\n  condition: sel and filter\n";
        let rule = Rule::from_yaml(yaml, "x").unwrap();
        assert_eq!(rule.condition, Condition::fallback());
        assert!(rule.matches(&EventRecord::new().with("Image", "A.EXE")));
    }

    #[test]
    fn test_unparseable_condition_falls_back() {
        let yaml = "title: X\ndetection:\n  sel:\n    Image: a.exe\n  condition: sel |\n";
        let rule = Rule::from_yaml(yaml, "x").unwrap();
        assert_eq!(rule.condition, Condition::fallback());
    }

    #[test]
    fn test_empty_detection_never_matches() {
        let yaml = "title: X\ndetection:\n  condition: all of them\n";
        let rule = Rule::from_yaml(yaml, "x").unwrap();
        assert!(!rule.matches(&EventRecord::new().with("Image", "a.exe")));
    }

    #[test]
    fn test_condition_list_is_disjunction() {
        let yaml = "title: X\ndetection:\n  a:\n    Image: a.exe\n  b:\n    Image: b.exe\n  condition:\n    - a\n    - b\n";
        let rule = Rule::from_yaml(yaml, "x").unwrap();
        assert!(rule.matches(&EventRecord::new().with("Image", "b.exe")));
    }

    #[test]
    fn test_load_dir_skips_invalid_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("process");
        fs::create_dir_all(&nested).unwrap();

        fs::write(nested.join("b_powershell.yml"), POWERSHELL_RULE).unwrap();
        fs::write(
            dir.path().join("a_whoami.yaml"),
            "title: Whoami\ndetection:\n  sel:\n    Image|endswith: whoami.exe\n  condition: sel\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("no_condition.yml"),
            "title: Broken\ndetection:\n  sel:\n    Image: x\n",
        )
        .unwrap();
        fs::write(dir.path().join("garbage.yml"), "title: [unclosed").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = RuleStore::load_dir(dir.path()).unwrap();
        let titles: Vec<&str> = store.rules().iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Whoami", "Suspicious PowerShell"]);
        assert_eq!(store.failed_rules().len(), 2);
    }

    #[test]
    fn test_load_missing_dir_is_empty() {
        let store = RuleStore::load_dir("does/not/exist").unwrap();
        assert!(store.is_empty());
    }
}
