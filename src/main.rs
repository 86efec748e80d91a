//! Vigil: process-creation detection and response agent
//!
//! Subscribes to process-creation telemetry, evaluates each event against a
//! directory of Sigma-style rules and optionally suspends or terminates the
//! offending process.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Builder;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use vigil::alerts::{audit, AlertSink, Notifier};
use vigil::collector::{ErrorCallback, EventCallback, Monitor};
use vigil::config::AppConfig;
use vigil::engine::Engine;
use vigil::intel::{HashListReputation, ReputationLookup};
use vigil::pipeline::Pipeline;
use vigil::response::{OsProcessControl, ResponseController, ResponsePolicy};
use vigil::state::ThreatSummarySlot;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Process-creation detection and response agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Override logging level (e.g., error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,
    /// Load configuration from this file instead of ./config.toml
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in console mode (foreground)
    Run {
        /// Force console output
        #[arg(long)]
        console: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let force_console = matches!(cli.command, Some(Commands::Run { console: true }));

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run_agent(cli.config, force_console, cli.log_level))
}

struct LoggingGuards {
    _app: WorkerGuard,
    _alerts: WorkerGuard,
    _feed: Option<WorkerGuard>,
}

fn init_logging(cfg: &AppConfig) -> (LoggingGuards, AlertSink) {
    if let Err(err) = std::fs::create_dir_all(&cfg.logging.directory)
        .with_context(|| format!("Failed to create log directory {:?}", cfg.logging.directory))
    {
        eprintln!("{}", err);
    }
    if let Err(err) = std::fs::create_dir_all(&cfg.alerts.directory).with_context(|| {
        format!(
            "Failed to create alerts directory {:?}",
            cfg.alerts.directory
        )
    }) {
        eprintln!("{}", err);
    }

    // 1. Operational logs (human readable)
    let app_file = rolling::daily(&cfg.logging.directory, &cfg.logging.filename);
    let (app_writer, app_guard) = tracing_appender::non_blocking(app_file);

    let app_layer = fmt::layer()
        .with_writer(app_writer)
        .compact()
        .with_ansi(false)
        .with_target(true)
        .with_filter(EnvFilter::new(&cfg.logging.level));

    // 2. Alerts (NDJSON), plus the optional live event feed
    let alert_file = rolling::daily(&cfg.alerts.directory, &cfg.alerts.filename);
    let (alert_writer, alert_guard) = tracing_appender::non_blocking(alert_file);
    let mut alert_sink = AlertSink::new(alert_writer);

    let feed_guard = if cfg.alerts.feed_enabled {
        let feed_file = rolling::daily(&cfg.alerts.directory, &cfg.alerts.feed_filename);
        let (feed_writer, feed_guard) = tracing_appender::non_blocking(feed_file);
        alert_sink = alert_sink.with_feed(feed_writer);
        Some(feed_guard)
    } else {
        None
    };

    // 3. Console (optional)
    let console_layer = if cfg.logging.console_output {
        Some(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_filter(EnvFilter::new(&cfg.logging.level)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(app_layer)
        .with(console_layer)
        .init();

    (
        LoggingGuards {
            _app: app_guard,
            _alerts: alert_guard,
            _feed: feed_guard,
        },
        alert_sink,
    )
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let loaded = match path {
        Some(path) => AppConfig::from_file(path),
        None => AppConfig::new(),
    };
    loaded.map_err(|err| {
        eprintln!("Failed to load configuration: {}", err);
        eprintln!("Hint: check config.toml and VIGIL__* environment overrides.");
        anyhow!("Failed to load configuration: {}", err)
    })
}

async fn run_agent(
    config_path: Option<PathBuf>,
    force_console: bool,
    log_level_override: Option<String>,
) -> Result<()> {
    // 1. Configuration
    let mut cfg = load_config(config_path.as_ref())?;
    if force_console {
        cfg.logging.console_output = true;
    }
    if let Some(level) = log_level_override {
        if !level.trim().is_empty() {
            cfg.logging.level = level;
        }
    }

    // 2. Logging. Guards must outlive every writer.
    let (_guards, alert_sink) = init_logging(&cfg);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        logs_dir = ?cfg.logging.directory,
        alerts_dir = ?cfg.alerts.directory,
        "Vigil starting"
    );
    warn_if_not_elevated();

    // 3. Rules
    let engine = Engine::from_dir(&cfg.rules.directory)
        .with_context(|| format!("Failed to load rules from {:?}", cfg.rules.directory))?;
    let stats = engine.stats();
    info!(
        total = stats.total_rules,
        failed = stats.failed_rules.len(),
        by_level = ?stats.rules_by_level,
        "Rule store ready"
    );
    if stats.total_rules == 0 {
        warn!("No rules loaded; events will be observed but never matched");
    }

    // 4. Response
    let policy = ResponsePolicy::from_config(&cfg.response);
    info!(
        protection = policy.enabled,
        auto_kill = policy.auto_kill,
        auto_suspend = policy.auto_suspend,
        "Response policy loaded"
    );
    let notifier: Arc<dyn Notifier> = Arc::new(alert_sink);
    let summary = Arc::new(ThreatSummarySlot::new());
    let controller = ResponseController::new(
        Arc::new(OsProcessControl),
        Arc::clone(&notifier),
        Arc::clone(&summary),
    );

    let mut pipeline = Pipeline::new(Arc::new(engine), controller, policy, notifier);
    if cfg.intel.enabled {
        match HashListReputation::load(&cfg.intel.hash_list) {
            Ok(list) => {
                let lookup: Arc<dyn ReputationLookup> = Arc::new(list);
                pipeline = pipeline.with_reputation(lookup);
            }
            Err(err) => warn!(error = %format!("{:#}", err), "Reputation lookups disabled"),
        }
    }
    let pipeline = Arc::new(pipeline);

    // 5. Telemetry. A blind monitor is not fatal to the host.
    let mut monitor = Monitor::from_config(&cfg.telemetry);
    start_monitoring(&mut monitor, Arc::clone(&pipeline));

    // 6. Wait for shutdown
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for Ctrl+C");
    }
    info!("Shutdown signal received");

    // Stop delivery before the pipeline goes away
    monitor.stop();

    let (events, detections, actions) = pipeline.counters().snapshot();
    let final_summary = summary.current();
    info!(events, detections, actions, "Session totals");
    info!(
        threat = %final_summary.name,
        level = %final_summary.level,
        location = %final_summary.location,
        action = %final_summary.action_taken,
        secure = final_summary.is_secure,
        "Threat summary"
    );
    audit(
        "INFO",
        "Monitoring stopped",
        &format!(
            "events={} detections={} actions={}",
            events, detections, actions
        ),
    );

    drop(pipeline);
    info!("Shutdown complete");
    Ok(())
}

/// Subscribe the pipeline to the first available telemetry source.
/// When none starts, the failure is logged and the monitor stays inert.
fn start_monitoring(monitor: &mut Monitor, pipeline: Arc<Pipeline>) -> bool {
    let on_event: EventCallback = Arc::new(move |event| {
        pipeline.handle_event(&event);
    });
    let on_error: ErrorCallback = Arc::new(|message| {
        error!("{}", message);
    });

    if monitor.start(on_event, on_error) {
        info!(
            source = monitor.active_source().unwrap_or("-"),
            "Monitoring active. Press Ctrl+C to stop"
        );
        true
    } else {
        warn!("Monitoring inactive; no events will be evaluated. Press Ctrl+C to exit");
        false
    }
}

/// Containment and the event-log subscription both need an elevated token
#[cfg(windows)]
fn warn_if_not_elevated() {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token = HANDLE::default();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token).is_err() {
            return;
        }
        let mut elevation = TOKEN_ELEVATION::default();
        let mut return_length = 0u32;
        let queried = GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut return_length,
        );
        let _ = CloseHandle(token);
        if queried.is_ok() && elevation.TokenIsElevated == 0 {
            warn!("Not running elevated; Sysmon subscription and containment may fail");
        }
    }
}

#[cfg(not(windows))]
fn warn_if_not_elevated() {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use vigil::collector::EventSource;
    use vigil::engine::RuleStore;
    use vigil::models::{AlertNotice, EventRecord};
    use vigil::response::ProcessControl;

    struct UnavailableSource;

    impl EventSource for UnavailableSource {
        fn name(&self) -> &'static str {
            "unavailable"
        }

        fn subscribe(&mut self, _on_event: EventCallback) -> Result<()> {
            bail!("provider not installed")
        }

        fn unsubscribe(&mut self) {}
    }

    struct NoopControl;

    impl ProcessControl for NoopControl {
        fn suspend(&self, _pid: u32) -> bool {
            false
        }

        fn terminate(&self, _pid: u32) -> bool {
            false
        }
    }

    struct NoopNotifier;

    impl Notifier for NoopNotifier {
        fn alert(&self, _notice: &AlertNotice) {}
        fn live_event(&self, _event: &EventRecord) {}
    }

    fn pipeline() -> Arc<Pipeline> {
        let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
        let controller = ResponseController::new(
            Arc::new(NoopControl),
            Arc::clone(&notifier),
            Arc::new(ThreatSummarySlot::new()),
        );
        Arc::new(Pipeline::new(
            Arc::new(Engine::new(RuleStore::new())),
            controller,
            ResponsePolicy::new(false, false, false),
            notifier,
        ))
    }

    #[test]
    fn test_total_source_failure_leaves_host_running() {
        let mut monitor = Monitor::new(vec![
            Box::new(UnavailableSource),
            Box::new(UnavailableSource),
        ]);

        assert!(!start_monitoring(&mut monitor, pipeline()));
        assert!(!monitor.is_running());
        assert_eq!(monitor.active_source(), None);

        // Shutdown path still runs cleanly on an inert monitor
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
