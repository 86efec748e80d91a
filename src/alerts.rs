//! Alert and live-feed sinks, plus the audit log.
//!
//! Alerts and normalized events are written as one JSON object per line
//! through non-blocking writers, so delivery never waits on the consumer.

use crate::models::{AlertNotice, EventRecord};
use serde::Serialize;
use std::io::Write;
use tracing::{info, warn};
use tracing_appender::non_blocking::NonBlocking;

const TARGET_AUDIT: &str = "audit";

/// Consumer of alert notifications and the raw normalized event feed
pub trait Notifier: Send + Sync {
    fn alert(&self, notice: &AlertNotice);
    fn live_event(&self, event: &EventRecord);
}

/// Record a `(type, message, details)` audit entry.
pub fn audit(kind: &str, message: &str, details: &str) {
    info!(target: TARGET_AUDIT, kind = %kind, details = %details, "{}", message);
}

#[derive(Clone)]
pub struct AlertSink {
    writer: NonBlocking,
    feed: Option<NonBlocking>,
}

impl AlertSink {
    pub fn new(writer: NonBlocking) -> Self {
        Self { writer, feed: None }
    }

    /// Also write every normalized event to a live-feed file
    pub fn with_feed(mut self, feed: NonBlocking) -> Self {
        self.feed = Some(feed);
        self
    }

    fn write_line<T: Serialize>(writer: &NonBlocking, value: &T, what: &str) {
        match serde_json::to_string(value) {
            Ok(line) => {
                let mut writer = writer.clone();
                if let Err(err) = writeln!(writer, "{}", line) {
                    warn!(error = %err, "Failed to write {}", what);
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to serialize {}", what);
            }
        }
    }
}

impl Notifier for AlertSink {
    fn alert(&self, notice: &AlertNotice) {
        Self::write_line(&self.writer, notice, "alert");
    }

    fn live_event(&self, event: &EventRecord) {
        if let Some(feed) = &self.feed {
            Self::write_line(feed, event, "live event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_alert_sink_writes_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let alerts_path = dir.path().join("alerts.json");
        let feed_path = dir.path().join("events.json");

        {
            let (alerts, _alerts_guard) =
                tracing_appender::non_blocking(fs::File::create(&alerts_path).unwrap());
            let (feed, _feed_guard) =
                tracing_appender::non_blocking(fs::File::create(&feed_path).unwrap());
            let sink = AlertSink::new(alerts).with_feed(feed);

            sink.alert(&AlertNotice {
                title: "Suspicious PowerShell".to_string(),
                level: "high".to_string(),
                timestamp: "2025-01-01T00:00:00Z".to_string(),
                pid: 4242,
            });
            sink.live_event(&EventRecord::new().with("EventID", "1"));
            // guards flush on drop
        }

        let alerts = fs::read_to_string(&alerts_path).unwrap();
        let line: serde_json::Value = serde_json::from_str(alerts.trim()).unwrap();
        assert_eq!(line["title"], "Suspicious PowerShell");
        assert_eq!(line["pid"], 4242);

        let feed = fs::read_to_string(&feed_path).unwrap();
        let line: serde_json::Value = serde_json::from_str(feed.trim()).unwrap();
        assert_eq!(line["EventID"], "1");
    }

    #[test]
    fn test_feed_disabled_by_default() {
        let (alerts, _guard) = tracing_appender::non_blocking(std::io::sink());
        let sink = AlertSink::new(alerts);
        sink.live_event(&EventRecord::new().with("EventID", "1"));
        assert!(sink.feed.is_none());
    }
}
