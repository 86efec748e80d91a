//! Process utilities: pid parsing and best-effort process-detail queries.

#[cfg(windows)]
use windows::core::PWSTR;
#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, HANDLE, UNICODE_STRING};
#[cfg(windows)]
use windows::Win32::System::Threading::{
    OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION,
};

#[cfg(windows)]
const PROCESS_COMMAND_LINE_INFORMATION: u32 = 60;
#[cfg(windows)]
const STATUS_INFO_LENGTH_MISMATCH: i32 = -1073741820; // 0xC0000004

#[cfg(windows)]
#[link(name = "ntdll")]
extern "system" {
    fn NtQueryInformationProcess(
        ProcessHandle: HANDLE,
        ProcessInformationClass: u32,
        ProcessInformation: *mut u8,
        ProcessInformationLength: u32,
        ReturnLength: *mut u32,
    ) -> i32;
}

/// Details backfilled for trace-sourced process starts.
/// Every field is optional; callers pick their own fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub command_line: Option<String>,
    pub user: Option<String>,
    pub executable_path: Option<String>,
}

/// Parse a decimal or `0x`-prefixed hex pid
pub fn parse_pid(value: Option<&str>) -> Option<u32> {
    let value = value?.trim();
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse::<u32>().ok()
    }
}

/// Query a process command line from a process handle.
/// Returns None if the command line is unavailable or the process exits.
#[cfg(windows)]
fn query_command_line(handle: HANDLE) -> Option<String> {
    unsafe {
        let mut return_length = 0u32;
        let status = NtQueryInformationProcess(
            handle,
            PROCESS_COMMAND_LINE_INFORMATION,
            std::ptr::null_mut(),
            0,
            &mut return_length,
        );

        if status != STATUS_INFO_LENGTH_MISMATCH || return_length == 0 {
            return None;
        }

        let mut buffer = vec![0u8; return_length as usize];
        let status = NtQueryInformationProcess(
            handle,
            PROCESS_COMMAND_LINE_INFORMATION,
            buffer.as_mut_ptr(),
            return_length,
            &mut return_length,
        );
        if status != 0 || buffer.len() < std::mem::size_of::<UNICODE_STRING>() {
            return None;
        }

        let unicode = &*(buffer.as_ptr() as *const UNICODE_STRING);
        if unicode.Length == 0 || unicode.Buffer.is_null() {
            return None;
        }

        // The string must live inside the buffer we own
        let len = (unicode.Length / 2) as usize;
        let buffer_start = buffer.as_ptr() as usize;
        let buffer_end = buffer_start + buffer.len();
        let cmd_ptr = unicode.Buffer.0 as usize;
        let cmd_end = cmd_ptr.saturating_add(len.saturating_mul(2));
        if cmd_ptr < buffer_start || cmd_end > buffer_end {
            return None;
        }

        let slice = std::slice::from_raw_parts(unicode.Buffer.0, len);
        let cmd = String::from_utf16_lossy(slice)
            .trim_end_matches('\0')
            .to_string();
        (!cmd.is_empty()).then_some(cmd)
    }
}

#[cfg(windows)]
fn query_image_path(handle: HANDLE) -> Option<String> {
    let mut buffer = vec![0u16; 1024];
    let mut size = buffer.len() as u32;
    unsafe {
        QueryFullProcessImageNameW(
            handle,
            PROCESS_NAME_WIN32,
            PWSTR(buffer.as_mut_ptr()),
            &mut size,
        )
        .ok()?;
    }
    let path = String::from_utf16_lossy(&buffer[..size as usize]);
    (!path.is_empty()).then_some(path)
}

/// Query command line, owning user and full image path by pid.
/// Any part that cannot be read is left as None.
#[cfg(windows)]
pub fn query_process_details(pid: u32) -> ProcessInfo {
    if pid == 0 {
        return ProcessInfo::default();
    }

    let handle = match unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) } {
        Ok(handle) if !handle.is_invalid() => handle,
        _ => return ProcessInfo::default(),
    };

    let info = ProcessInfo {
        command_line: query_command_line(handle),
        user: super::user::query_process_user(handle),
        executable_path: query_image_path(handle),
    };
    let _ = unsafe { CloseHandle(handle) };
    info
}

#[cfg(not(windows))]
pub fn query_process_details(_pid: u32) -> ProcessInfo {
    ProcessInfo::default()
}
