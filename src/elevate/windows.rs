use crate::elevate::{ElevateError, Environment, TokenPlatform, TokenSource};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_NO_TOKEN, ERROR_NOT_ALL_ASSIGNED, GetLastError, HANDLE, LUID,
};
use windows::Win32::Security::{
    AdjustTokenPrivileges, DuplicateTokenEx, GetTokenInformation, ImpersonateSelf,
    IsWellKnownSid, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW, RevertToSelf,
    SE_PRIVILEGE_ENABLED, SE_PRIVILEGE_REMOVED, SecurityImpersonation, TOKEN_ACCESS_MASK,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_DUPLICATE, TOKEN_IMPERSONATE, TOKEN_PRIVILEGES, TOKEN_QUERY,
    TOKEN_USER, TokenImpersonation, TokenPrivileges, TokenUser, WinLocalSystemSid,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::Services::{
    CloseServiceHandle, OpenSCManagerW, OpenServiceW, QueryServiceStatusEx,
    SC_MANAGER_CONNECT, SC_STATUS_PROCESS_INFO, SERVICE_QUERY_STATUS, SERVICE_STATUS_PROCESS,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThread, OpenProcess, OpenProcessToken, OpenThreadToken,
    PROCESS_QUERY_LIMITED_INFORMATION, SetThreadToken,
};
use windows::core::{HSTRING, PCWSTR};

const LOGON_MANAGER_IMAGE: &str = "winlogon.exe";
const DEBUG_PRIVILEGE: &str = "SeDebugPrivilege";

pub struct OwnedToken(pub(crate) HANDLE);

// Token handles may be closed from any thread.
unsafe impl Send for OwnedToken {}

impl Drop for OwnedToken {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

#[derive(Debug, Default)]
pub struct WindowsPlatform;

fn last_os_error(context: &'static str) -> ElevateError {
    ElevateError::os(context, std::io::Error::last_os_error())
}

fn open_process_token(pid: u32, access: TOKEN_ACCESS_MASK) -> Result<OwnedToken, ElevateError> {
    unsafe {
        let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid)
            .map_err(|e| ElevateError::os("OpenProcess", e))?;
        let mut token = HANDLE::default();
        let result = OpenProcessToken(process, access, &mut token);
        let _ = CloseHandle(process);
        result.map_err(|e| ElevateError::os("OpenProcessToken", e))?;
        Ok(OwnedToken(token))
    }
}

fn current_process_token(access: TOKEN_ACCESS_MASK) -> Result<OwnedToken, ElevateError> {
    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), access, &mut token)
            .map_err(|e| ElevateError::os("OpenProcessToken", e))?;
        Ok(OwnedToken(token))
    }
}

/// `None` when the calling thread is not impersonating.
fn current_thread_token(access: TOKEN_ACCESS_MASK) -> Result<Option<OwnedToken>, ElevateError> {
    let mut last_error = None;
    // The impersonated identity may not be allowed to open its own token.
    for open_as_self in [true, false] {
        let mut token = HANDLE::default();
        match unsafe { OpenThreadToken(GetCurrentThread(), access, open_as_self, &mut token) } {
            Ok(()) => return Ok(Some(OwnedToken(token))),
            Err(e) if e.code() == ERROR_NO_TOKEN.to_hresult() => return Ok(None),
            Err(e) => last_error = Some(e),
        }
    }
    match last_error {
        Some(e) => Err(ElevateError::os("OpenThreadToken", e)),
        None => Ok(None),
    }
}

/// The token the calling thread acts with: its impersonation token if it
/// has one, the process token otherwise.
pub(crate) fn effective_token(access: TOKEN_ACCESS_MASK) -> Result<OwnedToken, ElevateError> {
    match current_thread_token(access)? {
        Some(token) => Ok(token),
        None => current_process_token(access),
    }
}

pub(crate) fn token_information(
    token: &OwnedToken,
    class: windows::Win32::Security::TOKEN_INFORMATION_CLASS,
) -> Result<Vec<u8>, ElevateError> {
    unsafe {
        let mut needed = 0u32;
        let _ = GetTokenInformation(token.0, class, None, 0, &mut needed);
        if needed == 0 {
            return Err(last_os_error("GetTokenInformation"));
        }
        let mut buffer = vec![0u8; needed as usize];
        GetTokenInformation(
            token.0,
            class,
            Some(buffer.as_mut_ptr().cast()),
            needed,
            &mut needed,
        )
        .map_err(|e| ElevateError::os("GetTokenInformation", e))?;
        Ok(buffer)
    }
}

pub(crate) fn token_is_system(token: &OwnedToken) -> Result<bool, ElevateError> {
    let buffer = token_information(token, TokenUser)?;
    unsafe {
        let user = &*(buffer.as_ptr() as *const TOKEN_USER);
        Ok(IsWellKnownSid(user.User.Sid, WinLocalSystemSid).as_bool())
    }
}

fn duplicate_for_impersonation(token: &OwnedToken) -> Result<OwnedToken, ElevateError> {
    unsafe {
        let mut duplicate = HANDLE::default();
        DuplicateTokenEx(
            token.0,
            TOKEN_IMPERSONATE | TOKEN_QUERY,
            None,
            SecurityImpersonation,
            TokenImpersonation,
            &mut duplicate,
        )
        .map_err(|e| ElevateError::os("DuplicateTokenEx", e))?;
        Ok(OwnedToken(duplicate))
    }
}

fn lookup_privilege(name: &str) -> Result<LUID, ElevateError> {
    let name = HSTRING::from(name);
    let mut luid = LUID::default();
    unsafe {
        LookupPrivilegeValueW(PCWSTR::null(), &name, &mut luid)
            .map_err(|e| ElevateError::PrivilegeAdjustment(e.to_string()))?;
    }
    Ok(luid)
}

fn process_ids_named(image: &str) -> Result<Vec<u32>, ElevateError> {
    let mut pids = Vec::new();
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
            .map_err(|e| ElevateError::os("CreateToolhelp32Snapshot", e))?;
        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };
        let mut more = Process32FirstW(snapshot, &mut entry).is_ok();
        while more {
            let len = entry
                .szExeFile
                .iter()
                .position(|c| *c == 0)
                .unwrap_or(entry.szExeFile.len());
            let exe = String::from_utf16_lossy(&entry.szExeFile[..len]);
            if exe.eq_ignore_ascii_case(image) {
                pids.push(entry.th32ProcessID);
            }
            more = Process32NextW(snapshot, &mut entry).is_ok();
        }
        let _ = CloseHandle(snapshot);
    }
    Ok(pids)
}

fn service_process_id(service_name: &str) -> Result<u32, ElevateError> {
    let name = HSTRING::from(service_name);
    unsafe {
        let scm = OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), SC_MANAGER_CONNECT)
            .map_err(|e| ElevateError::os("OpenSCManager", e))?;
        let service = match OpenServiceW(scm, &name, SERVICE_QUERY_STATUS) {
            Ok(service) => service,
            Err(_) => {
                let _ = CloseServiceHandle(scm);
                return Err(ElevateError::ServiceNotRunning(service_name.to_string()));
            }
        };

        let mut status = SERVICE_STATUS_PROCESS::default();
        let mut needed = 0u32;
        let buffer = std::slice::from_raw_parts_mut(
            &mut status as *mut SERVICE_STATUS_PROCESS as *mut u8,
            std::mem::size_of::<SERVICE_STATUS_PROCESS>(),
        );
        let result = QueryServiceStatusEx(service, SC_STATUS_PROCESS_INFO, Some(buffer), &mut needed);
        let _ = CloseServiceHandle(service);
        let _ = CloseServiceHandle(scm);
        result.map_err(|e| ElevateError::os("QueryServiceStatusEx", e))?;

        match status.dwProcessId {
            0 => Err(ElevateError::ServiceNotRunning(service_name.to_string())),
            pid => Ok(pid),
        }
    }
}

pub(crate) fn parse_environment_block(block: *const u16) -> Environment {
    let mut environment = Environment::new();
    let mut offset = 0usize;
    unsafe {
        loop {
            let start = block.add(offset);
            let mut len = 0usize;
            while *start.add(len) != 0 {
                len += 1;
            }
            if len == 0 {
                break;
            }
            let entry = String::from_utf16_lossy(std::slice::from_raw_parts(start, len));
            // Entries such as "=C:=C:\" describe drive state and are skipped.
            if let Some((key, value)) = entry.split_once('=')
                && !key.is_empty()
            {
                environment.insert(key.to_string(), value.to_string());
            }
            offset += len + 1;
        }
    }
    environment
}

impl TokenPlatform for WindowsPlatform {
    type Token = OwnedToken;

    fn is_system_identity(&self) -> Result<bool, ElevateError> {
        token_is_system(&effective_token(TOKEN_QUERY)?)
    }

    fn enable_debug_privilege(&self) -> Result<(), ElevateError> {
        // Adjust a thread-local copy so other threads keep the process token as is.
        unsafe { ImpersonateSelf(SecurityImpersonation) }
            .map_err(|e| ElevateError::os("ImpersonateSelf", e))?;
        let token = current_thread_token(TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY)?
            .ok_or_else(|| ElevateError::PrivilegeAdjustment("thread has no token".to_string()))?;
        let luid = lookup_privilege(DEBUG_PRIVILEGE)?;
        let privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        unsafe {
            AdjustTokenPrivileges(token.0, false, Some(&privileges), 0, None, None)
                .map_err(|e| ElevateError::PrivilegeAdjustment(e.to_string()))?;
            if GetLastError() == ERROR_NOT_ALL_ASSIGNED {
                return Err(ElevateError::PrivilegeAdjustment(format!(
                    "{} is not held",
                    DEBUG_PRIVILEGE
                )));
            }
        }
        Ok(())
    }

    fn find_identity_token(&self, source: TokenSource<'_>) -> Result<OwnedToken, ElevateError> {
        match source {
            TokenSource::LogonManager => {
                for pid in process_ids_named(LOGON_MANAGER_IMAGE)? {
                    let Ok(token) = open_process_token(pid, TOKEN_QUERY | TOKEN_DUPLICATE) else {
                        continue;
                    };
                    if token_is_system(&token).unwrap_or(false) {
                        return duplicate_for_impersonation(&token);
                    }
                }
                Err(ElevateError::LogonManagerNotFound)
            }
            TokenSource::Service(service_name) => {
                let pid = service_process_id(service_name)?;
                let token = open_process_token(pid, TOKEN_QUERY | TOKEN_DUPLICATE)?;
                duplicate_for_impersonation(&token)
            }
        }
    }

    fn impersonate(&self, token: &OwnedToken) -> Result<(), ElevateError> {
        unsafe {
            SetThreadToken(None, token.0).map_err(|e| ElevateError::os("SetThreadToken", e))
        }
    }

    fn revert(&self) -> Result<(), ElevateError> {
        unsafe { RevertToSelf().map_err(|e| ElevateError::os("RevertToSelf", e)) }
    }

    fn environment_for(&self, token: Option<&OwnedToken>) -> Result<Environment, ElevateError> {
        let Some(token) = token else {
            return Ok(std::env::vars().collect());
        };
        unsafe {
            let mut block = std::ptr::null_mut();
            CreateEnvironmentBlock(&mut block, token.0, false)
                .map_err(|e| ElevateError::os("CreateEnvironmentBlock", e))?;
            let environment = parse_environment_block(block as *const u16);
            let _ = DestroyEnvironmentBlock(block);
            Ok(environment)
        }
    }

    fn drop_privileges(&self, retain: Option<&str>) -> Result<(), ElevateError> {
        let token = current_process_token(TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY)?;
        let retained = retain.map(lookup_privilege).transpose()?;

        let mut buffer = token_information(&token, TokenPrivileges)?;
        unsafe {
            let privileges = buffer.as_mut_ptr() as *mut TOKEN_PRIVILEGES;
            let count = (*privileges).PrivilegeCount as usize;
            let entries = std::slice::from_raw_parts_mut(
                (*privileges).Privileges.as_mut_ptr() as *mut LUID_AND_ATTRIBUTES,
                count,
            );
            for entry in entries.iter_mut() {
                let keep = retained.is_some_and(|luid| {
                    luid.LowPart == entry.Luid.LowPart && luid.HighPart == entry.Luid.HighPart
                });
                if !keep {
                    entry.Attributes = SE_PRIVILEGE_REMOVED;
                }
            }
            AdjustTokenPrivileges(token.0, false, Some(privileges), 0, None, None)
                .map_err(|e| ElevateError::PrivilegeAdjustment(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_privilege_stays_on_thread() {
        let platform = WindowsPlatform;
        let (has_thread_token, reverted) = std::thread::spawn(move || {
            // Unelevated runs cannot enable the privilege but still get a thread token.
            let _ = platform.enable_debug_privilege();
            let has_thread_token = current_thread_token(TOKEN_QUERY).unwrap().is_some();
            platform.revert().unwrap();
            let reverted = current_thread_token(TOKEN_QUERY).unwrap().is_none();
            (has_thread_token, reverted)
        })
        .join()
        .unwrap();

        assert!(has_thread_token);
        assert!(reverted);
        assert!(current_thread_token(TOKEN_QUERY).unwrap().is_none());
    }

    #[test]
    fn test_effective_token_without_impersonation_is_process_token() {
        let thread_view = token_is_system(&effective_token(TOKEN_QUERY).unwrap()).unwrap();
        let process_view = token_is_system(&current_process_token(TOKEN_QUERY).unwrap()).unwrap();
        assert_eq!(thread_view, process_view);
    }
}
