//! Process owner resolution helpers.

#[cfg(windows)]
use windows::core::{PCWSTR, PWSTR};
#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, HANDLE};
#[cfg(windows)]
use windows::Win32::Security::{
    GetTokenInformation, LookupAccountSidW, TokenUser, PSID, SID_NAME_USE, TOKEN_QUERY,
    TOKEN_USER,
};
#[cfg(windows)]
use windows::Win32::System::Threading::OpenProcessToken;

/// Resolve a SID into "DOMAIN\\User".
#[cfg(windows)]
fn lookup_account_sid(sid: PSID) -> Option<String> {
    let mut name_len = 0u32;
    let mut domain_len = 0u32;
    let mut sid_use = SID_NAME_USE(0);

    unsafe {
        let _ = LookupAccountSidW(
            PCWSTR::null(),
            sid,
            PWSTR::null(),
            &mut name_len,
            PWSTR::null(),
            &mut domain_len,
            &mut sid_use,
        );
    }

    if name_len == 0 {
        return None;
    }

    let mut name_buf = vec![0u16; name_len as usize];
    let mut domain_buf = vec![0u16; domain_len as usize];

    unsafe {
        LookupAccountSidW(
            PCWSTR::null(),
            sid,
            PWSTR(name_buf.as_mut_ptr()),
            &mut name_len,
            PWSTR(domain_buf.as_mut_ptr()),
            &mut domain_len,
            &mut sid_use,
        )
        .ok()?;
    }

    let name = String::from_utf16_lossy(&name_buf)
        .trim_end_matches('\0')
        .to_string();
    let domain = String::from_utf16_lossy(&domain_buf)
        .trim_end_matches('\0')
        .to_string();

    Some(format_account(&domain, &name))
}

/// Owning account of an open process handle (best-effort).
#[cfg(windows)]
pub fn query_process_user(process: HANDLE) -> Option<String> {
    let mut token = HANDLE::default();
    unsafe { OpenProcessToken(process, TOKEN_QUERY, &mut token) }.ok()?;

    let mut needed = 0u32;
    unsafe {
        let _ = GetTokenInformation(token, TokenUser, None, 0, &mut needed);
    }

    let user = if needed as usize >= std::mem::size_of::<TOKEN_USER>() {
        // u64 backing keeps the TOKEN_USER header aligned
        let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
        let queried = unsafe {
            GetTokenInformation(
                token,
                TokenUser,
                Some(buffer.as_mut_ptr().cast()),
                needed,
                &mut needed,
            )
        };
        match queried {
            Ok(()) => {
                let token_user = unsafe { &*(buffer.as_ptr() as *const TOKEN_USER) };
                lookup_account_sid(token_user.User.Sid)
            }
            Err(_) => None,
        }
    } else {
        None
    };

    let _ = unsafe { CloseHandle(token) };
    user
}

/// Join domain and account name the way the event log renders `User`
pub fn format_account(domain: &str, name: &str) -> String {
    if domain.is_empty() {
        name.to_string()
    } else {
        format!("{}\\{}", domain, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_account() {
        assert_eq!(format_account("NT AUTHORITY", "SYSTEM"), "NT AUTHORITY\\SYSTEM");
        assert_eq!(format_account("", "alice"), "alice");
    }
}
