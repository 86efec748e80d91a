//! Kernel process-start trace (ETW) fallback source
//!
//! Listens on Microsoft-Windows-Kernel-Process for process-start notifications
//! (opcode 1). Each notification only carries a pid and an image name, so the
//! record is backfilled through a [`ProcessDetails`] query.

use anyhow::Result;
use std::sync::Arc;

use super::{EventCallback, EventSource};
use crate::normalizer::{ProcessDetails, ProcessStart};
use crate::utils::image_basename;

/// Named so a stale session from a previous run can be stopped
pub const TRACE_SESSION_NAME: &str = "VigilProcessTrace";

pub const KERNEL_PROCESS_GUID: &str = "22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716";
/// WINEVENT_KEYWORD_PROCESS
pub const PROCESS_KEYWORDS: u64 = 0x10;
/// Process start; DCStart/DCEnd rundown opcodes are ignored
pub const PROCESS_START_OPCODE: u8 = 1;

pub struct ProcessTraceSource {
    details: Arc<dyn ProcessDetails>,
    #[cfg(windows)]
    session: Option<os::TraceSession>,
}

impl ProcessTraceSource {
    pub fn new(details: Arc<dyn ProcessDetails>) -> Self {
        Self {
            details,
            #[cfg(windows)]
            session: None,
        }
    }
}

/// Build a process start from the raw trace fields. The kernel reports the
/// image as a device path; only its final component is kept so the details
/// query can supply the DOS path.
pub fn process_start_from_trace(pid: u32, image_name: &str) -> ProcessStart {
    ProcessStart {
        pid,
        image: image_basename(image_name.trim()).to_string(),
    }
}

impl EventSource for ProcessTraceSource {
    fn name(&self) -> &'static str {
        "process-trace"
    }

    #[cfg(windows)]
    fn subscribe(&mut self, on_event: EventCallback) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        self.session = Some(os::TraceSession::start(
            Arc::clone(&self.details),
            on_event,
        )?);
        Ok(())
    }

    #[cfg(not(windows))]
    fn subscribe(&mut self, _on_event: EventCallback) -> Result<()> {
        // Keeps the details provider in use for the shared constructor
        let _ = &self.details;
        anyhow::bail!("Kernel process trace is only available on Windows")
    }

    fn unsubscribe(&mut self) {
        #[cfg(windows)]
        if let Some(session) = self.session.take() {
            session.stop();
        }
    }
}

#[cfg(windows)]
mod os {
    use anyhow::{anyhow, Result};
    use ferrisetw::parser::Parser;
    use ferrisetw::provider::Provider;
    use ferrisetw::schema_locator::SchemaLocator;
    use ferrisetw::trace::{stop_trace_by_name, TraceHandle, TraceTrait, UserTrace};
    use ferrisetw::{EventRecord as EtwRecord, GUID};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use tracing::{debug, error, info, warn};

    use super::{
        process_start_from_trace, KERNEL_PROCESS_GUID, PROCESS_KEYWORDS, PROCESS_START_OPCODE,
        TRACE_SESSION_NAME,
    };
    use crate::collector::{EventCallback, TARGET_COLLECTOR};
    use crate::normalizer::{normalize_process_start, ProcessDetails};

    pub(super) struct TraceSession {
        trace: UserTrace,
        worker: Option<JoinHandle<()>>,
    }

    // Only moved between threads for stop(); never shared.
    unsafe impl Send for TraceSession {}

    impl TraceSession {
        pub(super) fn start(
            details: Arc<dyn ProcessDetails>,
            on_event: EventCallback,
        ) -> Result<Self> {
            // A session left behind by a crashed run would make start() fail
            let _ = stop_trace_by_name(TRACE_SESSION_NAME);

            let provider = Provider::by_guid(GUID::from(KERNEL_PROCESS_GUID))
                .level(4)
                .any(PROCESS_KEYWORDS)
                .add_callback(move |record: &EtwRecord, schema_locator: &SchemaLocator| {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        handle_record(record, schema_locator, details.as_ref(), &on_event)
                    }));
                    if result.is_err() {
                        error!(target: TARGET_COLLECTOR, "Panic while handling process trace event");
                    }
                })
                .build();

            let (trace, handle) = UserTrace::new()
                .named(TRACE_SESSION_NAME.to_string())
                .enable(provider)
                .start()
                .map_err(|e| anyhow!("Failed to start process trace: {:?}", e))?;

            info!(
                target: TARGET_COLLECTOR,
                session = TRACE_SESSION_NAME,
                "Process trace session started"
            );

            let worker = std::thread::Builder::new()
                .name("process-trace".to_string())
                .spawn(move || process_events(handle))
                .map_err(|e| anyhow!("Failed to spawn trace worker: {}", e))?;

            Ok(Self {
                trace,
                worker: Some(worker),
            })
        }

        pub(super) fn stop(mut self) {
            let worker = self.worker.take();
            if let Err(e) = self.trace.stop() {
                warn!(target: TARGET_COLLECTOR, error = ?e, "Trace stop failed, stopping by name");
                let _ = stop_trace_by_name(TRACE_SESSION_NAME);
            }
            if let Some(worker) = worker {
                if worker.join().is_err() {
                    warn!(target: TARGET_COLLECTOR, "Trace worker exited abnormally");
                }
            }
            info!(target: TARGET_COLLECTOR, "Process trace session stopped");
        }
    }

    fn process_events(handle: TraceHandle) {
        // Blocks until the session is stopped
        if let Err(e) = UserTrace::process_from_handle(handle) {
            debug!(target: TARGET_COLLECTOR, error = ?e, "Trace processing ended");
        }
    }

    fn handle_record(
        record: &EtwRecord,
        schema_locator: &SchemaLocator,
        details: &dyn ProcessDetails,
        on_event: &EventCallback,
    ) {
        if record.opcode() != PROCESS_START_OPCODE {
            return;
        }

        let schema = match schema_locator.event_schema(record) {
            Ok(schema) => schema,
            Err(e) => {
                debug!(target: TARGET_COLLECTOR, error = ?e, "No schema for process event");
                return;
            }
        };
        let parser = Parser::create(record, &schema);

        let pid = parser.try_parse::<u32>("ProcessID").unwrap_or(0);
        let image_name = parser.try_parse::<String>("ImageName").unwrap_or_default();

        let start = process_start_from_trace(pid, &image_name);
        on_event(normalize_process_start(&start, details));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::OsProcessDetails;

    #[test]
    fn test_device_path_reduced_to_image_name() {
        let start = process_start_from_trace(
            1200,
            "\\Device\\HarddiskVolume3\\Windows\\System32\\notepad.exe",
        );
        assert_eq!(start.pid, 1200);
        assert_eq!(start.image, "notepad.exe");
    }

    #[test]
    fn test_empty_image_name_stays_empty() {
        let start = process_start_from_trace(0, "  ");
        assert!(start.image.is_empty());
    }

    #[test]
    fn test_unsubscribe_without_session() {
        let mut source = ProcessTraceSource::new(Arc::new(OsProcessDetails));
        assert_eq!(source.name(), "process-trace");
        source.unsubscribe();
        source.unsubscribe();
    }

    #[cfg(not(windows))]
    #[test]
    fn test_subscribe_fails_off_windows() {
        let mut source = ProcessTraceSource::new(Arc::new(OsProcessDetails));
        assert!(source.subscribe(Arc::new(|_event| {})).is_err());
    }
}
