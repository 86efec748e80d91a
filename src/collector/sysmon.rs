//! Sysmon operational event-log subscription

use anyhow::Result;
#[cfg(not(windows))]
use anyhow::bail;

use super::{EventCallback, EventSource};

#[cfg(windows)]
const TARGET_COLLECTOR: &str = "collector";

/// Live subscription to future Sysmon process-create events
pub struct SysmonSource {
    channel: String,
    query: String,
    #[cfg(windows)]
    subscription: Option<os::Subscription>,
}

impl SysmonSource {
    pub fn new(channel: &str, query: &str) -> Self {
        Self {
            channel: channel.to_string(),
            query: query.to_string(),
            #[cfg(windows)]
            subscription: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

impl EventSource for SysmonSource {
    fn name(&self) -> &'static str {
        "sysmon"
    }

    #[cfg(windows)]
    fn subscribe(&mut self, on_event: EventCallback) -> Result<()> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let subscription = os::Subscription::open(&self.channel, &self.query, on_event)?;
        tracing::info!(
            target: TARGET_COLLECTOR,
            channel = %self.channel,
            query = %self.query,
            "Subscribed to Sysmon event log"
        );
        self.subscription = Some(subscription);
        Ok(())
    }

    #[cfg(not(windows))]
    fn subscribe(&mut self, _on_event: EventCallback) -> Result<()> {
        bail!(
            "Sysmon channel {} is only available on Windows",
            self.channel
        )
    }

    fn unsubscribe(&mut self) {
        #[cfg(windows)]
        {
            // Dropping closes the handle and waits out in-flight callbacks
            self.subscription = None;
        }
    }
}

#[cfg(windows)]
mod os {
    use anyhow::{anyhow, Result};
    use std::ffi::c_void;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use tracing::{error, warn};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, HANDLE};
    use windows::Win32::System::EventLog::{
        EvtClose, EvtRender, EvtRenderEventXml, EvtSubscribe, EvtSubscribeActionError,
        EvtSubscribeToFutureEvents, EVT_HANDLE, EVT_SUBSCRIBE_NOTIFY_ACTION,
    };

    use super::TARGET_COLLECTOR;
    use crate::collector::EventCallback;
    use crate::normalizer::normalize_sysmon_xml;

    struct SubscriptionContext {
        on_event: EventCallback,
    }

    pub(super) struct Subscription {
        handle: EVT_HANDLE,
        // Referenced by the OS callback until the handle is closed
        _context: Box<SubscriptionContext>,
    }

    // The handle is an opaque kernel object; the context is Send + Sync.
    unsafe impl Send for Subscription {}

    impl Subscription {
        pub(super) fn open(channel: &str, query: &str, on_event: EventCallback) -> Result<Self> {
            let context = Box::new(SubscriptionContext { on_event });
            let channel_w = to_wide(channel);
            let query_w = to_wide(query);

            let handle = unsafe {
                EvtSubscribe(
                    EVT_HANDLE::default(),
                    HANDLE::default(),
                    PCWSTR(channel_w.as_ptr()),
                    PCWSTR(query_w.as_ptr()),
                    EVT_HANDLE::default(),
                    Some(&*context as *const SubscriptionContext as *const c_void),
                    Some(on_sysmon_event),
                    EvtSubscribeToFutureEvents.0,
                )
            }
            .map_err(|e| anyhow!("EvtSubscribe on {} failed: {}", channel, e))?;

            Ok(Self {
                handle,
                _context: context,
            })
        }
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            if let Err(err) = unsafe { EvtClose(self.handle) } {
                warn!(target: TARGET_COLLECTOR, error = %err, "EvtClose failed");
            }
        }
    }

    unsafe extern "system" fn on_sysmon_event(
        action: EVT_SUBSCRIBE_NOTIFY_ACTION,
        context: *const c_void,
        event: EVT_HANDLE,
    ) -> u32 {
        // A panic must never unwind across the OS callback boundary
        let result = catch_unwind(AssertUnwindSafe(|| {
            if context.is_null() {
                return;
            }
            if action == EvtSubscribeActionError {
                // For error notifications the event handle carries a Win32 code
                warn!(
                    target: TARGET_COLLECTOR,
                    code = event.0,
                    "Sysmon subscription reported an error"
                );
                return;
            }

            let ctx = &*(context as *const SubscriptionContext);
            match render_event_xml(event).and_then(|xml| normalize_sysmon_xml(&xml)) {
                Ok(record) => (ctx.on_event)(record),
                Err(err) => {
                    warn!(target: TARGET_COLLECTOR, error = %err, "Dropping unreadable Sysmon event");
                }
            }
        }));

        if result.is_err() {
            error!(target: TARGET_COLLECTOR, "Panic while handling Sysmon event");
        }
        0
    }

    fn render_event_xml(event: EVT_HANDLE) -> Result<String> {
        let mut used = 0u32;
        let mut count = 0u32;

        // First call sizes the buffer
        let sizing = unsafe {
            EvtRender(
                EVT_HANDLE::default(),
                event,
                EvtRenderEventXml.0,
                0,
                None,
                &mut used,
                &mut count,
            )
        };
        if let Err(err) = sizing {
            if err.code() != ERROR_INSUFFICIENT_BUFFER.to_hresult() {
                return Err(anyhow!("EvtRender sizing failed: {}", err));
            }
        }
        if used == 0 {
            return Err(anyhow!("EvtRender returned an empty event"));
        }

        let mut buffer = vec![0u16; (used as usize).div_ceil(2)];
        unsafe {
            EvtRender(
                EVT_HANDLE::default(),
                event,
                EvtRenderEventXml.0,
                (buffer.len() * 2) as u32,
                Some(buffer.as_mut_ptr() as *mut c_void),
                &mut used,
                &mut count,
            )
        }
        .map_err(|e| anyhow!("EvtRender failed: {}", e))?;

        let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
        Ok(String::from_utf16_lossy(&buffer[..len]))
    }

    fn to_wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }
}
