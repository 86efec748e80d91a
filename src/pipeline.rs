//! Detection pipeline
//!
//! Glues a normalized event through the engine and the response controller,
//! then out to the sinks. Runs on whichever thread the telemetry source
//! delivers on; everything it touches is shared read-only or internally locked.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alerts::{audit, Notifier};
use crate::engine::Engine;
use crate::intel::{Reputation, ReputationLookup};
use crate::models::{EventRecord, FIELD_IMAGE};
use crate::response::{Decision, ResponseController, ResponsePolicy};
use crate::state::SessionCounters;
use crate::utils::has_path_separator;

const TARGET_ENGINE: &str = "engine";
const TARGET_INTEL: &str = "intel";

pub struct Pipeline {
    engine: Arc<Engine>,
    controller: ResponseController,
    policy: ResponsePolicy,
    notifier: Arc<dyn Notifier>,
    reputation: Option<Arc<dyn ReputationLookup>>,
    counters: Arc<SessionCounters>,
}

impl Pipeline {
    pub fn new(
        engine: Arc<Engine>,
        controller: ResponseController,
        policy: ResponsePolicy,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            controller,
            policy,
            notifier,
            reputation: None,
            counters: Arc::new(SessionCounters::new()),
        }
    }

    pub fn with_reputation(mut self, reputation: Arc<dyn ReputationLookup>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    pub fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }

    pub fn controller(&self) -> &ResponseController {
        &self.controller
    }

    /// Evaluate one event. Returns the decision when any rule matched.
    pub fn handle_event(&self, event: &EventRecord) -> Option<Decision> {
        self.counters.record_event();
        self.notifier.live_event(event);

        let matches = self.engine.evaluate(event);
        if matches.is_empty() {
            return None;
        }

        debug!(
            target: TARGET_ENGINE,
            matches = matches.len(),
            event_id = event.event_id().unwrap_or("-"),
            "Event matched rules"
        );
        self.counters.record_detections(matches.len());

        let decision = self.controller.decide(event, &matches, &self.policy);
        if decision.action.is_some() {
            self.counters.record_action();
        }

        if let Some(reputation) = &self.reputation {
            self.check_reputation(reputation.as_ref(), event);
        }

        Some(decision)
    }

    fn check_reputation(&self, reputation: &dyn ReputationLookup, event: &EventRecord) {
        // Bare image names cannot be located on disk
        let Some(image) = event.get(FIELD_IMAGE).filter(|i| has_path_separator(i)) else {
            return;
        };

        match reputation.lookup(Path::new(image)) {
            verdict @ Reputation::Flagged(sources) if verdict.is_malicious() => {
                warn!(
                    target: TARGET_INTEL,
                    image = %image,
                    sources,
                    "Matched image has a known-bad hash"
                );
                audit(
                    "INTEL",
                    "Known-bad image",
                    &format!("{} flagged by {} source(s)", image, sources),
                );
            }
            Reputation::Unavailable => {
                debug!(target: TARGET_INTEL, image = %image, "Reputation unavailable");
            }
            _ => {
                info!(target: TARGET_INTEL, image = %image, "Matched image has no known-bad hash");
            }
        }
    }
}
