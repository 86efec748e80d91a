//! Process control primitive: suspend and terminate by pid.
//!
//! Every failure collapses to `false`; nothing is returned as an error.

use tracing::{info, warn};

use crate::alerts::audit;

const TARGET_RESPONSE: &str = "response";

/// Containment operations against a live process
pub trait ProcessControl: Send + Sync {
    /// Suspend every thread of the process. Reversible with a resume.
    fn suspend(&self, pid: u32) -> bool;
    /// Terminate immediately, without a graceful shutdown
    fn terminate(&self, pid: u32) -> bool;
}

/// OS-backed process control
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn suspend(&self, pid: u32) -> bool {
        match suspend_process(pid) {
            Ok(()) => {
                info!(target: TARGET_RESPONSE, pid, "Process suspended");
                audit("ACTION", "Process suspended", &format!("PID {}", pid));
                true
            }
            Err(err) => {
                warn!(target: TARGET_RESPONSE, pid, error = %err, "Failed to suspend process");
                audit(
                    "ERROR",
                    "Failed to suspend process",
                    &format!("PID {}: {}", pid, err),
                );
                false
            }
        }
    }

    fn terminate(&self, pid: u32) -> bool {
        match terminate_process(pid) {
            Ok(()) => {
                info!(target: TARGET_RESPONSE, pid, "Process terminated");
                audit("ACTION", "Process terminated", &format!("PID {}", pid));
                true
            }
            Err(err) => {
                warn!(target: TARGET_RESPONSE, pid, error = %err, "Failed to terminate process");
                audit(
                    "ERROR",
                    "Failed to terminate process",
                    &format!("PID {}: {}", pid, err),
                );
                false
            }
        }
    }
}

#[cfg(windows)]
mod os {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, TerminateProcess, PROCESS_ACCESS_RIGHTS,
        PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SUSPEND_RESUME, PROCESS_TERMINATE,
    };

    const STILL_ACTIVE: u32 = 259;

    #[link(name = "ntdll")]
    extern "system" {
        fn NtSuspendProcess(ProcessHandle: HANDLE) -> i32;
    }

    /// Owned process handle, closed on drop
    struct ProcessHandle(HANDLE);

    impl ProcessHandle {
        fn open(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Result<Self, String> {
            let handle = unsafe {
                OpenProcess(access | PROCESS_QUERY_LIMITED_INFORMATION, false, pid)
            }
            .map_err(|err| format!("OpenProcess failed: {}", err))?;
            if handle.is_invalid() {
                return Err("OpenProcess returned an invalid handle".to_string());
            }
            Ok(Self(handle))
        }

        fn has_exited(&self) -> bool {
            let mut code = 0u32;
            match unsafe { GetExitCodeProcess(self.0, &mut code) } {
                Ok(()) => code != STILL_ACTIVE,
                Err(_) => false,
            }
        }
    }

    impl Drop for ProcessHandle {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    pub fn suspend_process(pid: u32) -> Result<(), String> {
        let handle = ProcessHandle::open(pid, PROCESS_SUSPEND_RESUME)?;
        if handle.has_exited() {
            return Err("process has already exited".to_string());
        }
        let status = unsafe { NtSuspendProcess(handle.0) };
        if status == 0 {
            Ok(())
        } else {
            Err(format!("NtSuspendProcess failed: 0x{:08X}", status as u32))
        }
    }

    pub fn terminate_process(pid: u32) -> Result<(), String> {
        let handle = ProcessHandle::open(pid, PROCESS_TERMINATE)?;
        if handle.has_exited() {
            return Err("process has already exited".to_string());
        }
        unsafe { TerminateProcess(handle.0, 1) }
            .map_err(|err| format!("TerminateProcess failed: {}", err))
    }
}

#[cfg(windows)]
use os::{suspend_process, terminate_process};

#[cfg(not(windows))]
fn suspend_process(_pid: u32) -> Result<(), String> {
    Err("Process suspension is only supported on Windows".to_string())
}

#[cfg(not(windows))]
fn terminate_process(_pid: u32) -> Result<(), String> {
    Err("Process termination is only supported on Windows".to_string())
}

#[cfg(all(test, not(windows)))]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_platform_returns_false() {
        let control = OsProcessControl;
        assert!(!control.suspend(4242));
        assert!(!control.terminate(4242));
    }
}
