//! Configuration module
//!
//! Provides structured configuration for the Vigil agent.
//! Configuration can be loaded from:
//! 1. Default values (hardcoded)
//! 2. config.toml file (optional)
//! 3. Environment variables with VIGIL__ prefix
//!
//! Example environment variable override:
//! VIGIL__LOGGING__LEVEL=debug
//! VIGIL__RESPONSE__AUTO_KILL=true

use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_SYSMON_CHANNEL: &str = "Microsoft-Windows-Sysmon/Operational";
pub const DEFAULT_SYSMON_QUERY: &str = "*[System[(EventID=1)]]";

/// Main application configuration
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub rules: RulesConfig,
    pub telemetry: TelemetryConfig,
    pub response: ResponseConfig,
    pub logging: LogConfig,
    pub alerts: AlertConfig,
    pub intel: IntelConfig,
}

/// Rule source
#[derive(Debug, Deserialize)]
pub struct RulesConfig {
    pub directory: PathBuf,
}

/// Telemetry source selection
#[derive(Debug, Deserialize)]
pub struct TelemetryConfig {
    /// Try the Sysmon event-log subscription before the process trace
    pub sysmon_enabled: bool,
    pub sysmon_channel: String,
    pub sysmon_query: String,
}

/// Active response policy
#[derive(Debug, Deserialize)]
pub struct ResponseConfig {
    pub enabled: bool,
    pub auto_kill: bool,
    pub auto_suspend: bool,
    pub allowlist_images: Vec<String>,
    pub allowlist_paths: Vec<String>,
}

/// Operational logging configuration (application debug logs)
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub directory: PathBuf,
    pub filename: String,
    pub console_output: bool,
}

/// Alert and live-feed NDJSON output
#[derive(Debug, Deserialize)]
pub struct AlertConfig {
    pub directory: PathBuf,
    pub filename: String,
    pub feed_filename: String,
    pub feed_enabled: bool,
}

/// Local file-hash reputation list
#[derive(Debug, Deserialize)]
pub struct IntelConfig {
    pub enabled: bool,
    pub hash_list: PathBuf,
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and environment variables
    pub fn new() -> Result<Self, config::ConfigError> {
        Self::builder()?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Load from an explicit config file instead of `config.toml` in the working directory
    pub fn from_file(path: &std::path::Path) -> Result<Self, config::ConfigError> {
        Self::builder()?
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?
            .try_deserialize()
    }

    fn builder(
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            // Rules
            .set_default("rules.directory", "rules")?
            // Telemetry
            .set_default("telemetry.sysmon_enabled", true)?
            .set_default("telemetry.sysmon_channel", DEFAULT_SYSMON_CHANNEL)?
            .set_default("telemetry.sysmon_query", DEFAULT_SYSMON_QUERY)?
            // Active Response
            .set_default("response.enabled", true)?
            .set_default("response.auto_kill", false)?
            .set_default("response.auto_suspend", false)?
            .set_default("response.allowlist_images", Vec::<String>::new())?
            .set_default("response.allowlist_paths", Vec::<String>::new())?
            // Logging
            .set_default("logging.level", "info")?
            .set_default("logging.directory", "logs")?
            .set_default("logging.filename", "vigil.log")?
            .set_default("logging.console_output", true)?
            // Alerts
            .set_default("alerts.directory", "logs")?
            .set_default("alerts.filename", "alerts.json")?
            .set_default("alerts.feed_filename", "events.json")?
            .set_default("alerts.feed_enabled", false)?
            // Intel
            .set_default("intel.enabled", false)?
            .set_default("intel.hash_list", "rules/bad_hashes.txt")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rules: RulesConfig {
                directory: PathBuf::from("rules"),
            },
            telemetry: TelemetryConfig {
                sysmon_enabled: true,
                sysmon_channel: DEFAULT_SYSMON_CHANNEL.to_string(),
                sysmon_query: DEFAULT_SYSMON_QUERY.to_string(),
            },
            response: ResponseConfig {
                enabled: true,
                auto_kill: false,
                auto_suspend: false,
                allowlist_images: Vec::new(),
                allowlist_paths: Vec::new(),
            },
            logging: LogConfig {
                level: "info".to_string(),
                directory: PathBuf::from("logs"),
                filename: "vigil.log".to_string(),
                console_output: true,
            },
            alerts: AlertConfig {
                directory: PathBuf::from("logs"),
                filename: "alerts.json".to_string(),
                feed_filename: "events.json".to_string(),
                feed_enabled: false,
            },
            intel: IntelConfig {
                enabled: false,
                hash_list: PathBuf::from("rules/bad_hashes.txt"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_loads_defaults() {
        let cfg = AppConfig::new().unwrap();
        assert_eq!(cfg.rules.directory, PathBuf::from("rules"));
        assert!(cfg.telemetry.sysmon_enabled);
        assert_eq!(cfg.telemetry.sysmon_channel, DEFAULT_SYSMON_CHANNEL);
        assert!(cfg.response.enabled);
        assert!(!cfg.response.auto_kill);
        assert!(!cfg.response.auto_suspend);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.alerts.feed_enabled);
        assert!(!cfg.intel.enabled);
    }

    #[test]
    fn test_config_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[response]\nauto_kill = true\nallowlist_images = [\"svchost.exe\"]\n\n[telemetry]\nsysmon_enabled = false"
        )
        .unwrap();

        let cfg = AppConfig::from_file(file.path()).unwrap();
        assert!(cfg.response.auto_kill);
        assert!(!cfg.response.auto_suspend);
        assert_eq!(cfg.response.allowlist_images, vec!["svchost.exe".to_string()]);
        assert!(!cfg.telemetry.sysmon_enabled);
        assert_eq!(cfg.logging.filename, "vigil.log");
    }

    #[test]
    fn test_default_matches_loaded_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.alerts.filename, "alerts.json");
        assert_eq!(cfg.telemetry.sysmon_query, DEFAULT_SYSMON_QUERY);
    }
}
