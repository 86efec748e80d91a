//! Time helpers.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn now_timestamp_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Normalize an event-log `SystemTime` attribute to RFC 3339 seconds.
/// Values that fail to parse are passed through unchanged.
pub fn normalize_system_time(value: &str) -> String {
    match DateTime::parse_from_rfc3339(value.trim()) {
        Ok(ts) => ts
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_system_time() {
        assert_eq!(
            normalize_system_time("2025-01-01T10:20:30.1234567Z"),
            "2025-01-01T10:20:30Z"
        );
        assert_eq!(normalize_system_time("garbage"), "garbage");
    }
}
