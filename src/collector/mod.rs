//! Telemetry collector module
//!
//! Wraps the two process-creation telemetry providers behind one
//! [`EventSource`] interface and picks one at startup:
//!
//! 1. Sysmon operational event log (live subscription, full field set)
//! 2. Kernel process-start trace (ETW), backfilled with a process-details query
//!
//! The [`Monitor`] tries sources in order and keeps the first that subscribes.
//! When every source fails, monitoring stays inert and the error callback
//! receives one message naming each failure.

mod process_trace;
mod sysmon;

pub use process_trace::ProcessTraceSource;
pub use sysmon::SysmonSource;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::audit;
use crate::config::TelemetryConfig;
use crate::models::EventRecord;
use crate::normalizer::OsProcessDetails;

const TARGET_COLLECTOR: &str = "collector";

/// Receives each normalized event, on the provider's callback thread
pub type EventCallback = Arc<dyn Fn(EventRecord) + Send + Sync>;
/// Receives a description of a fatal monitoring failure
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// One telemetry provider
pub trait EventSource: Send {
    fn name(&self) -> &'static str;

    /// Begin delivering events. Must not block.
    fn subscribe(&mut self, on_event: EventCallback) -> Result<()>;

    /// Stop delivering events. Safe to call repeatedly or when never subscribed.
    fn unsubscribe(&mut self);
}

/// Ordered set of sources with failover on subscription failure
pub struct Monitor {
    sources: Vec<Box<dyn EventSource>>,
    active: Option<usize>,
}

impl Monitor {
    pub fn new(sources: Vec<Box<dyn EventSource>>) -> Self {
        Self {
            sources,
            active: None,
        }
    }

    /// Sysmon first when enabled, then the kernel process trace
    pub fn from_config(cfg: &TelemetryConfig) -> Self {
        let mut sources: Vec<Box<dyn EventSource>> = Vec::new();
        if cfg.sysmon_enabled {
            sources.push(Box::new(SysmonSource::new(
                &cfg.sysmon_channel,
                &cfg.sysmon_query,
            )));
        }
        sources.push(Box::new(ProcessTraceSource::new(Arc::new(
            OsProcessDetails,
        ))));
        Self::new(sources)
    }

    /// Subscribe to the first source that accepts. Returns whether any did.
    pub fn start(&mut self, on_event: EventCallback, on_error: ErrorCallback) -> bool {
        if let Some(idx) = self.active {
            warn!(
                target: TARGET_COLLECTOR,
                source = self.sources[idx].name(),
                "Monitor already started"
            );
            return true;
        }

        let mut failures = Vec::new();
        for (idx, source) in self.sources.iter_mut().enumerate() {
            match source.subscribe(Arc::clone(&on_event)) {
                Ok(()) => {
                    info!(
                        target: TARGET_COLLECTOR,
                        source = source.name(),
                        "Telemetry source subscribed"
                    );
                    audit("INFO", "Monitoring started", source.name());
                    self.active = Some(idx);
                    return true;
                }
                Err(err) => {
                    warn!(
                        target: TARGET_COLLECTOR,
                        source = source.name(),
                        error = %format!("{:#}", err),
                        "Telemetry source unavailable, trying next"
                    );
                    // Leave nothing half-open before the next attempt
                    source.unsubscribe();
                    failures.push(format!("{}: {:#}", source.name(), err));
                }
            }
        }

        let message = if failures.is_empty() {
            "Failed to start monitoring: no telemetry sources configured".to_string()
        } else {
            format!("Failed to start monitoring. {}", failures.join("; "))
        };
        audit("ERROR", "Monitoring unavailable", &message);
        on_error(message);
        false
    }

    /// Unsubscribe every source. Idempotent.
    pub fn stop(&mut self) {
        for source in self.sources.iter_mut() {
            source.unsubscribe();
        }
        if let Some(idx) = self.active.take() {
            info!(
                target: TARGET_COLLECTOR,
                source = self.sources[idx].name(),
                "Telemetry source unsubscribed"
            );
        }
    }

    pub fn active_source(&self) -> Option<&'static str> {
        self.active.map(|idx| self.sources[idx].name())
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        subscribed: AtomicUsize,
        unsubscribed: AtomicUsize,
    }

    struct FakeSource {
        name: &'static str,
        fail: bool,
        counters: Arc<Counters>,
        callback: Arc<Mutex<Option<EventCallback>>>,
    }

    impl FakeSource {
        fn new(name: &'static str, fail: bool) -> (Self, Arc<Counters>, Arc<Mutex<Option<EventCallback>>>) {
            let counters = Arc::new(Counters::default());
            let callback = Arc::new(Mutex::new(None));
            (
                Self {
                    name,
                    fail,
                    counters: Arc::clone(&counters),
                    callback: Arc::clone(&callback),
                },
                counters,
                callback,
            )
        }
    }

    impl EventSource for FakeSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn subscribe(&mut self, on_event: EventCallback) -> Result<()> {
            if self.fail {
                return Err(anyhow!("{} not installed", self.name));
            }
            self.counters.subscribed.fetch_add(1, Ordering::SeqCst);
            *self.callback.lock().unwrap() = Some(on_event);
            Ok(())
        }

        fn unsubscribe(&mut self) {
            self.counters.unsubscribed.fetch_add(1, Ordering::SeqCst);
            *self.callback.lock().unwrap() = None;
        }
    }

    fn noop_event() -> EventCallback {
        Arc::new(|_event| {})
    }

    fn error_sink() -> (ErrorCallback, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&errors);
        (
            Arc::new(move |msg| captured.lock().unwrap().push(msg)),
            errors,
        )
    }

    #[test]
    fn test_primary_source_used_when_available() {
        let (primary, primary_counters, _) = FakeSource::new("sysmon", false);
        let (secondary, secondary_counters, _) = FakeSource::new("trace", false);
        let mut monitor = Monitor::new(vec![Box::new(primary), Box::new(secondary)]);
        let (on_error, errors) = error_sink();

        assert!(monitor.start(noop_event(), on_error));
        assert_eq!(monitor.active_source(), Some("sysmon"));
        assert_eq!(primary_counters.subscribed.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_counters.subscribed.load(Ordering::SeqCst), 0);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_falls_back_to_secondary() {
        let (primary, _, _) = FakeSource::new("sysmon", true);
        let (secondary, _, callback) = FakeSource::new("trace", false);
        let mut monitor = Monitor::new(vec![Box::new(primary), Box::new(secondary)]);
        let (on_error, errors) = error_sink();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let on_event: EventCallback = Arc::new(move |event| sink.lock().unwrap().push(event));

        assert!(monitor.start(on_event, on_error));
        assert_eq!(monitor.active_source(), Some("trace"));
        assert!(errors.lock().unwrap().is_empty());

        let emit = callback.lock().unwrap().clone().unwrap();
        emit(EventRecord::new().with("EventID", "1"));
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_all_sources_failing_reports_error_and_stays_inert() {
        let (primary, _, _) = FakeSource::new("sysmon", true);
        let (secondary, _, _) = FakeSource::new("trace", true);
        let mut monitor = Monitor::new(vec![Box::new(primary), Box::new(secondary)]);
        let (on_error, errors) = error_sink();

        assert!(!monitor.start(noop_event(), on_error));
        assert!(!monitor.is_running());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("sysmon not installed"));
        assert!(errors[0].contains("trace not installed"));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (primary, counters, callback) = FakeSource::new("sysmon", false);
        let mut monitor = Monitor::new(vec![Box::new(primary)]);

        // Never started
        monitor.stop();
        assert!(!monitor.is_running());

        let (on_error, _) = error_sink();
        assert!(monitor.start(noop_event(), on_error));
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
        assert!(callback.lock().unwrap().is_none());
        assert!(counters.unsubscribed.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_start_twice_keeps_first_subscription() {
        let (primary, counters, _) = FakeSource::new("sysmon", false);
        let mut monitor = Monitor::new(vec![Box::new(primary)]);
        let (on_error, _) = error_sink();

        assert!(monitor.start(noop_event(), on_error.clone()));
        assert!(monitor.start(noop_event(), on_error));
        assert_eq!(counters.subscribed.load(Ordering::SeqCst), 1);
    }
}
