//! Response controller.
//!
//! Turns the matches for one event into per-match outcomes, at most one
//! containment action, and the updated Threat Summary.

mod process;

pub use process::{OsProcessControl, ProcessControl};

use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{audit, Notifier};
use crate::config::ResponseConfig;
use crate::models::{
    ActionTaken, AlertNotice, ContainmentAction, EventRecord, Match, MatchOutcome, ThreatSummary,
    FIELD_IMAGE,
};
use crate::state::ThreatSummarySlot;
use crate::utils::{image_basename, normalize_path, now_timestamp_string};

const TARGET_RESPONSE: &str = "response";

/// Title phrase that makes a rule kill-eligible regardless of its level
pub const ESCALATION_PHRASE: &str = "PowerShell Encoded";

/// Policy snapshot consulted for every decision
#[derive(Debug, Clone)]
pub struct ResponsePolicy {
    /// Global containment switch
    pub enabled: bool,
    pub auto_kill: bool,
    pub auto_suspend: bool,
    allowlist_images: Vec<String>,
    allowlist_paths: Vec<String>,
    self_pid: u32,
}

impl ResponsePolicy {
    pub fn new(enabled: bool, auto_kill: bool, auto_suspend: bool) -> Self {
        Self {
            enabled,
            auto_kill,
            auto_suspend,
            allowlist_images: Vec::new(),
            allowlist_paths: Vec::new(),
            self_pid: std::process::id(),
        }
    }

    pub fn from_config(cfg: &ResponseConfig) -> Self {
        Self::new(cfg.enabled, cfg.auto_kill, cfg.auto_suspend)
            .with_allowlist(&cfg.allowlist_images, &cfg.allowlist_paths)
    }

    pub fn with_allowlist(mut self, images: &[String], paths: &[String]) -> Self {
        self.allowlist_images = normalize_allowlist_images(images);
        self.allowlist_paths = normalize_allowlist_paths(paths);
        self
    }

    /// System pids and the agent itself are never contained
    pub fn is_protected_pid(&self, pid: u32) -> bool {
        pid <= 4 || pid == self.self_pid
    }

    pub fn is_allowlisted(&self, image: &str) -> bool {
        is_allowlisted(image, &self.allowlist_images, &self.allowlist_paths)
    }
}

/// Result of one `decide` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcomes: Vec<MatchOutcome>,
    /// Strongest containment action taken; a terminate supersedes an earlier suspend
    pub action: Option<ContainmentAction>,
    /// New Threat Summary, when the batch had any match
    pub summary: Option<ThreatSummary>,
}

pub struct ResponseController {
    control: Arc<dyn ProcessControl>,
    notifier: Arc<dyn Notifier>,
    summary: Arc<ThreatSummarySlot>,
}

impl ResponseController {
    pub fn new(
        control: Arc<dyn ProcessControl>,
        notifier: Arc<dyn Notifier>,
        summary: Arc<ThreatSummarySlot>,
    ) -> Self {
        Self {
            control,
            notifier,
            summary,
        }
    }

    pub fn summary_slot(&self) -> &Arc<ThreatSummarySlot> {
        &self.summary
    }

    /// Process the matches of one event in engine order
    pub fn decide(
        &self,
        event: &EventRecord,
        matches: &[Match],
        policy: &ResponsePolicy,
    ) -> Decision {
        let pid = event.process_id();
        let timestamp = now_timestamp_string();
        let mut action: Option<ContainmentAction> = None;
        let mut outcomes = Vec::with_capacity(matches.len());

        for matched in matches {
            audit(
                "DETECTION",
                &matched.title,
                &format!(
                    "Level: {} | Event: {}",
                    matched.level,
                    event.event_id().unwrap_or("-")
                ),
            );

            let action_taken = self.respond(event, matched, pid, policy, &mut action);

            self.notifier.alert(&AlertNotice {
                title: matched.title.clone(),
                level: matched.level.clone(),
                timestamp: timestamp.clone(),
                pid: pid.unwrap_or(0),
            });
            if action_taken.is_secure() {
                self.notifier.alert(&AlertNotice {
                    title: action_taken.as_str().to_string(),
                    level: "critical".to_string(),
                    timestamp: timestamp.clone(),
                    pid: pid.unwrap_or(0),
                });
            }

            outcomes.push(MatchOutcome {
                matched: matched.clone(),
                action_taken,
            });
        }

        let summary = select_summary(&outcomes).map(ThreatSummary::from_outcome);
        if let Some(summary) = &summary {
            self.summary.replace(summary.clone());
        }

        Decision {
            outcomes,
            action,
            summary,
        }
    }

    fn respond(
        &self,
        event: &EventRecord,
        matched: &Match,
        pid: Option<u32>,
        policy: &ResponsePolicy,
        action: &mut Option<ContainmentAction>,
    ) -> ActionTaken {
        if !policy.enabled {
            return ActionTaken::DetectedOnly;
        }

        let Some(pid) = pid else {
            warn!(
                target: TARGET_RESPONSE,
                rule = %matched.title,
                "Response skipped: missing pid"
            );
            return ActionTaken::DetectedOnly;
        };

        // A terminated process stays terminated for the rest of the batch
        if let Some(previous @ ContainmentAction::Terminate(_)) = *action {
            return previous.outcome();
        }
        let already_suspended = matches!(*action, Some(ContainmentAction::Suspend(_)));

        if policy.is_protected_pid(pid) {
            info!(
                target: TARGET_RESPONSE,
                pid,
                rule = %matched.title,
                "Response skipped: protected pid"
            );
            return ActionTaken::DetectedOnly;
        }

        if let Some(image) = event.get(FIELD_IMAGE) {
            if policy.is_allowlisted(image) {
                info!(
                    target: TARGET_RESPONSE,
                    pid,
                    image = %image,
                    rule = %matched.title,
                    "Response skipped: allowlisted"
                );
                return ActionTaken::DetectedOnly;
            }
        }

        let kill_eligible = policy.auto_kill
            && (matched.is_severe() || matched.title.contains(ESCALATION_PHRASE));

        if kill_eligible && self.control.terminate(pid) {
            info!(
                target: TARGET_RESPONSE,
                pid,
                rule = %matched.title,
                level = %matched.level,
                "Active response terminated process"
            );
            audit(
                "PROTECTION",
                "Process Terminated",
                &format!("Killed process {} triggered by rule {}", pid, matched.title),
            );
            *action = Some(ContainmentAction::Terminate(pid));
            return ActionTaken::ProcessTerminated;
        }

        // Never suspend the same process twice in one batch
        if already_suspended {
            return ActionTaken::ProcessSuspended;
        }

        if policy.auto_suspend && self.control.suspend(pid) {
            info!(
                target: TARGET_RESPONSE,
                pid,
                rule = %matched.title,
                level = %matched.level,
                "Active response suspended process"
            );
            audit(
                "PROTECTION",
                "Process Suspended",
                &format!("Suspended process {} triggered by rule {}", pid, matched.title),
            );
            *action = Some(ContainmentAction::Suspend(pid));
            return ActionTaken::ProcessSuspended;
        }

        ActionTaken::DetectedOnly
    }
}

/// Tie-break: remediated beats unremediated, then high/critical beats the
/// rest; remaining ties keep the earlier match.
pub fn select_summary(outcomes: &[MatchOutcome]) -> Option<&MatchOutcome> {
    let mut iter = outcomes.iter();
    let mut candidate = iter.next()?;
    for later in iter {
        let secure_upgrade = !candidate.is_secure() && later.is_secure();
        let severity_upgrade = candidate.is_secure() == later.is_secure()
            && later.matched.is_severe()
            && !candidate.matched.is_severe();
        if secure_upgrade || severity_upgrade {
            candidate = later;
        }
    }
    Some(candidate)
}

fn normalize_allowlist_paths(values: &[String]) -> Vec<String> {
    values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .map(|value| {
            let mut normalized = normalize_path(value);
            if !normalized.ends_with('\\') {
                normalized.push('\\');
            }
            normalized
        })
        .collect()
}

fn normalize_allowlist_images(values: &[String]) -> Vec<String> {
    values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .map(|value| normalize_path(value))
        .collect()
}

fn is_allowlisted(image: &str, allowlist_images: &[String], allowlist_paths: &[String]) -> bool {
    let normalized = normalize_path(image);

    if allowlist_paths
        .iter()
        .any(|prefix| normalized.starts_with(prefix))
    {
        return true;
    }

    let basename = image_basename(&normalized);
    allowlist_images.iter().any(|entry| {
        if entry.contains('\\') {
            normalized == *entry
        } else {
            basename == entry
        }
    })
}
