//! Selection expressions and per-field string matching.
//!
//! A selection is compiled from the YAML value under a detection key:
//! sequences are OR, mappings are AND across keys and OR across the
//! expected values of one key.

use anyhow::{anyhow, Result};
use serde_yaml::Value;
use tracing::debug;

use crate::models::EventRecord;

const TARGET_ENGINE: &str = "engine";

/// Compiled selection expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Sequence: any element must match
    Any(Vec<Selection>),
    /// Mapping: every field matcher must match
    All(Vec<FieldMatcher>),
    /// Bare scalar where a selection was expected; never matches
    Scalar,
}

/// String comparison applied between an event value and an expected value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    /// Exact equality with leading/trailing `*` wildcards
    Default,
    Contains,
    StartsWith,
    EndsWith,
}

/// One `field[|modifier]: value(s)` entry of a mapping selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatcher {
    pub field: String,
    pub modifier: Modifier,
    /// Expected values, OR'd
    pub values: Vec<String>,
}

impl Selection {
    /// Compile a YAML selection value
    pub fn compile(value: &Value) -> Result<Self> {
        match value {
            Value::Sequence(items) => Ok(Selection::Any(
                items.iter().map(Selection::compile).collect::<Result<_>>()?,
            )),
            Value::Mapping(map) => {
                let mut matchers = Vec::with_capacity(map.len());
                for (key, expected) in map {
                    let key = scalar_to_string(key)
                        .ok_or_else(|| anyhow!("selection key must be a scalar"))?;
                    matchers.push(FieldMatcher::compile(&key, expected)?);
                }
                Ok(Selection::All(matchers))
            }
            Value::Tagged(tagged) => Selection::compile(&tagged.value),
            _ => Ok(Selection::Scalar),
        }
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        match self {
            Selection::Any(items) => items.iter().any(|item| item.matches(event)),
            Selection::All(matchers) => matchers.iter().all(|m| m.matches(event)),
            Selection::Scalar => false,
        }
    }
}

impl FieldMatcher {
    /// Compile `field[|modifier]` and its expected value(s)
    pub fn compile(key: &str, expected: &Value) -> Result<Self> {
        let (field, modifier) = parse_field_key(key);
        if field.is_empty() {
            return Err(anyhow!("empty field name in selection key '{}'", key));
        }

        let values = match expected {
            Value::Sequence(items) => items
                .iter()
                .map(|item| expected_to_string(item, key))
                .collect::<Result<Vec<_>>>()?,
            other => vec![expected_to_string(other, key)?],
        };

        Ok(Self {
            field: field.to_string(),
            modifier,
            values,
        })
    }

    /// A missing field fails the matcher outright
    pub fn matches(&self, event: &EventRecord) -> bool {
        let Some(actual) = event.get(&self.field) else {
            return false;
        };
        self.values
            .iter()
            .any(|expected| check_value(actual, expected, self.modifier))
    }
}

/// Split `Image|endswith` into field and modifier.
/// Only the first modifier is honored; unknown ones use default semantics.
fn parse_field_key(key: &str) -> (&str, Modifier) {
    let mut parts = key.split('|');
    let field = parts.next().unwrap_or_default().trim();
    let modifier = match parts.next().map(|m| m.trim().to_ascii_lowercase()) {
        None => Modifier::Default,
        Some(m) => match m.as_str() {
            "" => Modifier::Default,
            "contains" => Modifier::Contains,
            "startswith" => Modifier::StartsWith,
            "endswith" => Modifier::EndsWith,
            other => {
                debug!(
                    target: TARGET_ENGINE,
                    key = %key,
                    modifier = %other,
                    "Unsupported modifier; using default comparison"
                );
                Modifier::Default
            }
        },
    };
    (field, modifier)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

fn expected_to_string(value: &Value, key: &str) -> Result<String> {
    scalar_to_string(value)
        .ok_or_else(|| anyhow!("expected value for '{}' must be a scalar or list of scalars", key))
}

/// Compare one event value against one expected value.
/// An empty expected value always matches.
pub fn check_value(actual: &str, expected: &str, modifier: Modifier) -> bool {
    if expected.is_empty() {
        return true;
    }

    match modifier {
        Modifier::Contains => contains_ignore_case(actual, expected),
        Modifier::StartsWith => starts_with_ignore_case(actual, expected),
        Modifier::EndsWith => ends_with_ignore_case(actual, expected),
        Modifier::Default => {
            let leading = expected.starts_with('*');
            let trailing = expected.ends_with('*');
            match (leading, trailing) {
                (true, true) => contains_ignore_case(actual, expected.trim_matches('*')),
                (false, true) => starts_with_ignore_case(actual, expected.trim_end_matches('*')),
                (true, false) => ends_with_ignore_case(actual, expected.trim_start_matches('*')),
                (false, false) => eq_ignore_case(actual, expected),
            }
        }
    }
}

// Zero-allocation ASCII paths; non-ASCII input is lowercased first.

fn eq_ignore_case(value: &str, pattern: &str) -> bool {
    if value.is_ascii() && pattern.is_ascii() {
        value.eq_ignore_ascii_case(pattern)
    } else {
        value.to_lowercase() == pattern.to_lowercase()
    }
}

fn contains_ignore_case(value: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    if !(value.is_ascii() && pattern.is_ascii()) {
        return value.to_lowercase().contains(&pattern.to_lowercase());
    }
    if value.len() < pattern.len() {
        return false;
    }
    (0..=(value.len() - pattern.len()))
        .any(|i| value[i..i + pattern.len()].eq_ignore_ascii_case(pattern))
}

fn starts_with_ignore_case(value: &str, pattern: &str) -> bool {
    if !(value.is_ascii() && pattern.is_ascii()) {
        return value.to_lowercase().starts_with(&pattern.to_lowercase());
    }
    value.len() >= pattern.len() && value[..pattern.len()].eq_ignore_ascii_case(pattern)
}

fn ends_with_ignore_case(value: &str, pattern: &str) -> bool {
    if !(value.is_ascii() && pattern.is_ascii()) {
        return value.to_lowercase().ends_with(&pattern.to_lowercase());
    }
    let start = value.len().saturating_sub(pattern.len());
    value.len() >= pattern.len() && value[start..].eq_ignore_ascii_case(pattern)
}
