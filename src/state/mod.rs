//! Shared session state.
//!
//! Holds the Threat Summary slot, read for reporting and written by the
//! response controller from the telemetry callback thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::models::ThreatSummary;

/// Lock-protected holder of the session's most significant threat
#[derive(Debug, Default)]
pub struct ThreatSummarySlot {
    summary: RwLock<ThreatSummary>,
}

impl ThreatSummarySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current summary
    pub fn current(&self) -> ThreatSummary {
        match self.summary.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, summary: ThreatSummary) {
        match self.summary.write() {
            Ok(mut guard) => *guard = summary,
            Err(poisoned) => *poisoned.into_inner() = summary,
        }
    }
}

/// Session counters reported at shutdown
#[derive(Debug, Default)]
pub struct SessionCounters {
    events: AtomicU64,
    detections: AtomicU64,
    actions: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detections(&self, count: usize) {
        self.detections.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_action(&self) {
        self.actions.fetch_add(1, Ordering::Relaxed);
    }

    /// (events, detections, actions)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.events.load(Ordering::Relaxed),
            self.detections.load(Ordering::Relaxed),
            self.actions.load(Ordering::Relaxed),
        )
    }
}
