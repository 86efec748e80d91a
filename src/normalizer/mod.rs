//! Event normalizer module
//!
//! Converts raw telemetry into flat Event Records. Sysmon events keep every
//! named data field verbatim; trace-sourced process starts are synthesized as
//! Sysmon process-create events and backfilled from a process-details query.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;
use tracing::debug;

use crate::models::{
    EventRecord, FIELD_COMMAND_LINE, FIELD_EVENT_ID, FIELD_IMAGE, FIELD_PROCESS_ID,
    FIELD_TIME_CREATED, FIELD_USER,
};
use crate::utils::time::normalize_system_time;
use crate::utils::{has_path_separator, now_timestamp_string, query_process_details, ProcessInfo};

const TARGET_COLLECTOR: &str = "collector";

/// Event id synthesized for trace-sourced process starts
pub const PROCESS_CREATE_EVENT_ID: &str = "1";

static EVENT_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<EventID(?:\s[^>]*)?>\s*(\d+)\s*</EventID>")
        .expect("EVENT_ID_REGEX pattern is valid")
});

static TIME_CREATED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<TimeCreated\s+SystemTime\s*=\s*['"]([^'"]*)['"]"#)
        .expect("TIME_CREATED_REGEX pattern is valid")
});

/// `<Data Name='X'>value</Data>` and the self-closing `<Data Name='X'/>`
static DATA_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<Data\s+Name\s*=\s*['"]([^'"]*)['"]\s*(?:/>|>(.*?)</Data>)"#)
        .expect("DATA_REGEX pattern is valid")
});

/// Normalize a rendered Sysmon event (event-log XML) into an Event Record
pub fn normalize_sysmon_xml(xml: &str) -> Result<EventRecord> {
    let event_id = EVENT_ID_REGEX
        .captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("event XML has no EventID"))?;

    let time_created = TIME_CREATED_REGEX
        .captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| normalize_system_time(m.as_str()))
        .unwrap_or_else(now_timestamp_string);

    let mut fields: Vec<(String, String)> = DATA_REGEX
        .captures_iter(xml)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str();
            if name.is_empty() {
                return None;
            }
            let value = caps.get(2).map(|m| unescape_xml(m.as_str())).unwrap_or_default();
            Some((name.to_string(), value.into_owned()))
        })
        .collect();

    fields.push((FIELD_EVENT_ID.to_string(), event_id));
    fields.push((FIELD_TIME_CREATED.to_string(), time_created));

    Ok(fields.into_iter().collect())
}

/// Decode the predefined XML entities and numeric character references
pub fn unescape_xml(value: &str) -> Cow<'_, str> {
    if !value.contains('&') {
        return Cow::Borrowed(value);
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];

        let decoded = rest.find(';').and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            }?;
            Some((c, end))
        });

        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Process start reported by the kernel trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStart {
    pub pid: u32,
    /// Bare image name as reported by the trace; may be empty
    pub image: String,
}

/// Best-effort details for a running process
pub trait ProcessDetails: Send + Sync {
    fn query(&self, pid: u32) -> ProcessInfo;
}

/// Queries the live process through the OS
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessDetails;

impl ProcessDetails for OsProcessDetails {
    fn query(&self, pid: u32) -> ProcessInfo {
        query_process_details(pid)
    }
}

/// Synthesize a process-create Event Record from a trace notification
pub fn normalize_process_start(start: &ProcessStart, details: &dyn ProcessDetails) -> EventRecord {
    let process_name = if start.image.trim().is_empty() {
        "Unknown"
    } else {
        start.image.as_str()
    };

    let mut image = process_name.to_string();
    let (command_line, user) = if start.pid > 0 {
        let info = details.query(start.pid);
        if !has_path_separator(process_name) {
            if let Some(path) = info.executable_path.filter(|p| !p.is_empty()) {
                image = path;
            }
        }
        (
            info.command_line
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| process_name.to_string()),
            info.user
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| "System".to_string()),
        )
    } else {
        (process_name.to_string(), "System".to_string())
    };

    debug!(
        target: TARGET_COLLECTOR,
        pid = start.pid,
        image = %image,
        command_line = %command_line,
        "Process start normalized"
    );

    EventRecord::new()
        .with(FIELD_EVENT_ID, PROCESS_CREATE_EVENT_ID)
        .with(FIELD_TIME_CREATED, now_timestamp_string())
        .with(FIELD_IMAGE, image)
        .with(FIELD_PROCESS_ID, start.pid.to_string())
        .with(FIELD_COMMAND_LINE, command_line)
        .with(FIELD_USER, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSMON_XML: &str = r#"<Event xmlns='http://schemas.microsoft.com/win/2004/08/events/event'><System><Provider Name='Microsoft-Windows-Sysmon' Guid='{5770385f-c22a-43e0-bf4c-06f5698ffbd9}'/><EventID>1</EventID><Version>5</Version><TimeCreated SystemTime='2025-03-01T12:34:56.7890123Z'/><Computer>HOST</Computer></System><EventData><Data Name='RuleName'>-</Data><Data Name='Image'>C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe</Data><Data Name='CommandLine'>powershell.exe -enc ZQBj &amp; "x" &lt;y&gt;</Data><Data Name='ProcessId'>4242</Data><Data Name='User'>HOST\alice</Data><Data Name='ParentImage'/><Data Name='Hashes'></Data></EventData></Event>"#;

    #[test]
    fn test_sysmon_fields_copied_verbatim() {
        let event = normalize_sysmon_xml(SYSMON_XML).unwrap();
        assert_eq!(event.get("EventID"), Some("1"));
        assert_eq!(event.get("TimeCreated"), Some("2025-03-01T12:34:56Z"));
        assert_eq!(
            event.get("Image"),
            Some("C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe")
        );
        assert_eq!(
            event.get("CommandLine"),
            Some("powershell.exe -enc ZQBj & \"x\" <y>")
        );
        assert_eq!(event.get("ProcessId"), Some("4242"));
        assert_eq!(event.get("User"), Some("HOST\\alice"));
        assert_eq!(event.get("ParentImage"), Some(""));
        assert_eq!(event.get("Hashes"), Some(""));
        assert_eq!(event.get("RuleName"), Some("-"));
        assert!(!event.contains("Computer"));
    }

    #[test]
    fn test_sysmon_without_event_id_is_error() {
        assert!(normalize_sysmon_xml("<Event><EventData/></Event>").is_err());
    }

    #[test]
    fn test_sysmon_without_time_gets_timestamp() {
        let event = normalize_sysmon_xml("<Event><System><EventID>1</EventID></System></Event>")
            .unwrap();
        assert!(event.get("TimeCreated").is_some_and(|t| !t.is_empty()));
    }

    #[test]
    fn test_unescape_xml() {
        assert_eq!(unescape_xml("plain"), "plain");
        assert_eq!(unescape_xml("a &amp;&amp; b"), "a && b");
        assert_eq!(unescape_xml("&#65;&#x42;"), "AB");
        assert_eq!(unescape_xml("R&D &unknown; &"), "R&D &unknown; &");
    }

    struct FakeDetails(ProcessInfo);

    impl ProcessDetails for FakeDetails {
        fn query(&self, _pid: u32) -> ProcessInfo {
            self.0.clone()
        }
    }

    #[test]
    fn test_process_start_backfills_details() {
        let details = FakeDetails(ProcessInfo {
            command_line: Some("notepad.exe C:\\notes.txt".to_string()),
            user: Some("HOST\\bob".to_string()),
            executable_path: Some("C:\\Windows\\notepad.exe".to_string()),
        });
        let event = normalize_process_start(
            &ProcessStart {
                pid: 100,
                image: "notepad.exe".to_string(),
            },
            &details,
        );
        assert_eq!(event.get("EventID"), Some("1"));
        assert_eq!(event.get("Image"), Some("C:\\Windows\\notepad.exe"));
        assert_eq!(event.get("ProcessId"), Some("100"));
        assert_eq!(event.get("CommandLine"), Some("notepad.exe C:\\notes.txt"));
        assert_eq!(event.get("User"), Some("HOST\\bob"));
    }

    #[test]
    fn test_process_start_falls_back_when_details_missing() {
        let details = FakeDetails(ProcessInfo::default());
        let event = normalize_process_start(
            &ProcessStart {
                pid: 100,
                image: "evil.exe".to_string(),
            },
            &details,
        );
        assert_eq!(event.get("Image"), Some("evil.exe"));
        assert_eq!(event.get("CommandLine"), Some("evil.exe"));
        assert_eq!(event.get("User"), Some("System"));
    }

    #[test]
    fn test_process_start_keeps_full_path_image() {
        let details = FakeDetails(ProcessInfo {
            executable_path: Some("D:\\other.exe".to_string()),
            ..ProcessInfo::default()
        });
        let event = normalize_process_start(
            &ProcessStart {
                pid: 7,
                image: "C:\\Tools\\tool.exe".to_string(),
            },
            &details,
        );
        assert_eq!(event.get("Image"), Some("C:\\Tools\\tool.exe"));
    }

    #[test]
    fn test_process_start_without_pid_or_name() {
        let details = FakeDetails(ProcessInfo {
            user: Some("ignored".to_string()),
            ..ProcessInfo::default()
        });
        let event = normalize_process_start(
            &ProcessStart {
                pid: 0,
                image: String::new(),
            },
            &details,
        );
        assert_eq!(event.get("Image"), Some("Unknown"));
        assert_eq!(event.get("ProcessId"), Some("0"));
        assert_eq!(event.get("User"), Some("System"));
    }
}
