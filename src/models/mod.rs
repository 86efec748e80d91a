//! Data models module
//!
//! Defines the Event Record flowing through the pipeline, the Match produced
//! by the engine, and the response outcome types reported to collaborators.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::utils::parse_pid;

/// Field holding the telemetry event identifier
pub const FIELD_EVENT_ID: &str = "EventID";
/// Field holding the event timestamp
pub const FIELD_TIME_CREATED: &str = "TimeCreated";
pub const FIELD_IMAGE: &str = "Image";
pub const FIELD_COMMAND_LINE: &str = "CommandLine";
pub const FIELD_PROCESS_ID: &str = "ProcessId";
pub const FIELD_USER: &str = "User";

/// Flat, case-sensitive field mapping produced once per telemetry notification.
///
/// Records are built by the normalizer and never mutated afterwards; the
/// engine and response controller only ever see `&EventRecord`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRecord {
    fields: HashMap<String, String>,
}

impl EventRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert used while normalizing
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn event_id(&self) -> Option<&str> {
        self.get(FIELD_EVENT_ID)
    }

    /// Process id of the subject process, if present and numeric
    pub fn process_id(&self) -> Option<u32> {
        parse_pid(self.get(FIELD_PROCESS_ID))
    }

    /// Best-effort location: image path, else command line, else "Unknown"
    pub fn location(&self) -> String {
        [FIELD_IMAGE, FIELD_COMMAND_LINE]
            .iter()
            .filter_map(|field| self.get(field))
            .find(|value| !value.trim().is_empty())
            .unwrap_or("Unknown")
            .to_string()
    }
}

impl<K, V> FromIterator<(K, V)> for EventRecord
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Result of one rule matching one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub location: String,
}

impl Match {
    pub fn is_severe(&self) -> bool {
        is_severe_level(&self.level)
    }
}

/// `high` and `critical` levels, compared case-insensitively
pub fn is_severe_level(level: &str) -> bool {
    let level = level.trim();
    level.eq_ignore_ascii_case("high") || level.eq_ignore_ascii_case("critical")
}

/// Containment action issued against a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "pid", rename_all = "snake_case")]
pub enum ContainmentAction {
    Suspend(u32),
    Terminate(u32),
}

impl ContainmentAction {
    pub fn pid(self) -> u32 {
        match self {
            Self::Suspend(pid) | Self::Terminate(pid) => pid,
        }
    }

    pub fn outcome(self) -> ActionTaken {
        match self {
            Self::Suspend(_) => ActionTaken::ProcessSuspended,
            Self::Terminate(_) => ActionTaken::ProcessTerminated,
        }
    }
}

/// Outcome label reported for a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionTaken {
    DetectedOnly,
    ProcessSuspended,
    ProcessTerminated,
}

impl ActionTaken {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DetectedOnly => "Detected Only",
            Self::ProcessSuspended => "PROCESS SUSPENDED",
            Self::ProcessTerminated => "PROCESS TERMINATED",
        }
    }

    /// Remediated outcomes are reported as secure
    pub fn is_secure(self) -> bool {
        !matches!(self, Self::DetectedOnly)
    }
}

impl fmt::Display for ActionTaken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-match result of a response decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: Match,
    pub action_taken: ActionTaken,
}

impl MatchOutcome {
    pub fn is_secure(&self) -> bool {
        self.action_taken.is_secure()
    }
}

/// Most significant match and its response for the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatSummary {
    pub name: String,
    pub level: String,
    pub location: String,
    pub description: String,
    pub action_taken: String,
    pub is_secure: bool,
}

impl ThreatSummary {
    pub fn from_outcome(outcome: &MatchOutcome) -> Self {
        let matched = &outcome.matched;
        Self {
            name: matched.title.clone(),
            level: matched.level.clone(),
            location: matched.location.clone(),
            description: matched
                .description
                .clone()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| "Threat detected based on behavioral analysis.".to_string()),
            action_taken: outcome.action_taken.as_str().to_string(),
            is_secure: outcome.is_secure(),
        }
    }
}

impl Default for ThreatSummary {
    fn default() -> Self {
        Self {
            name: "None".to_string(),
            level: "-".to_string(),
            location: "-".to_string(),
            description: "No threats detected in the current session.".to_string(),
            action_taken: "-".to_string(),
            is_secure: true,
        }
    }
}

/// Alert pushed to the alert sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertNotice {
    pub title: String,
    pub level: String,
    pub timestamp: String,
    pub pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_prefers_image() {
        let event = EventRecord::new()
            .with(FIELD_IMAGE, "C:\\Temp\\evil.exe")
            .with(FIELD_COMMAND_LINE, "evil.exe -x");
        assert_eq!(event.location(), "C:\\Temp\\evil.exe");

        let event = EventRecord::new().with(FIELD_COMMAND_LINE, "evil.exe -x");
        assert_eq!(event.location(), "evil.exe -x");

        assert_eq!(EventRecord::new().location(), "Unknown");
    }

    #[test]
    fn test_process_id_parsing() {
        let event = EventRecord::new().with(FIELD_PROCESS_ID, "4242");
        assert_eq!(event.process_id(), Some(4242));

        let event = EventRecord::new().with(FIELD_PROCESS_ID, "not-a-pid");
        assert_eq!(event.process_id(), None);
    }

    #[test]
    fn test_severity_is_case_insensitive() {
        assert!(is_severe_level("HIGH"));
        assert!(is_severe_level("Critical"));
        assert!(!is_severe_level("medium"));
        assert!(!is_severe_level("informational"));
    }

    #[test]
    fn test_summary_defaults_description() {
        let outcome = MatchOutcome {
            matched: Match {
                title: "Rule".to_string(),
                rule_id: None,
                level: "low".to_string(),
                description: None,
                location: "Unknown".to_string(),
            },
            action_taken: ActionTaken::DetectedOnly,
        };
        let summary = ThreatSummary::from_outcome(&outcome);
        assert_eq!(
            summary.description,
            "Threat detected based on behavioral analysis."
        );
        assert_eq!(summary.action_taken, "Detected Only");
        assert!(!summary.is_secure);
    }
}
