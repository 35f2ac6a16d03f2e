//! Processes created under an explicit token instead of the manager's own.

use crate::elevate::Environment;
use crate::elevate::windows::{OwnedToken, effective_token};
use anyhow::Context;
use std::ffi::c_void;
use std::fs::File;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use windows::Win32::Foundation::{
    HANDLE, HANDLE_FLAG_INHERIT, HANDLE_FLAGS, SetHandleInformation, WAIT_FAILED,
};
use windows::Win32::Security::{
    DuplicateTokenEx, SECURITY_ATTRIBUTES, SecurityImpersonation, SetTokenInformation,
    TOKEN_ADJUST_DEFAULT, TOKEN_ADJUST_SESSIONID, TOKEN_ASSIGN_PRIMARY, TOKEN_DUPLICATE,
    TOKEN_QUERY, TokenPrimary, TokenSessionId,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, CreateProcessAsUserW, GetExitCodeProcess,
    INFINITE, PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOW, TerminateProcess,
    WaitForSingleObject,
};
use windows::core::{PCWSTR, PWSTR};

/// Desktop of the interactive window station.
pub const INTERACTIVE_DESKTOP: &str = "winsta0\\default";

/// Turns `token` into a primary token that `CreateProcessAsUserW` accepts,
/// optionally moved into another terminal services session.
pub(crate) fn primary_token(token: &OwnedToken, session: Option<u32>) -> anyhow::Result<OwnedToken> {
    let mut duplicate = HANDLE::default();
    unsafe {
        DuplicateTokenEx(
            token.0,
            TOKEN_QUERY
                | TOKEN_DUPLICATE
                | TOKEN_ASSIGN_PRIMARY
                | TOKEN_ADJUST_DEFAULT
                | TOKEN_ADJUST_SESSIONID,
            None,
            SecurityImpersonation,
            TokenPrimary,
            &mut duplicate,
        )
        .context("DuplicateTokenEx")?;
    }
    let duplicate = OwnedToken(duplicate);

    if let Some(session) = session {
        unsafe {
            SetTokenInformation(
                duplicate.0,
                TokenSessionId,
                &session as *const u32 as *const c_void,
                std::mem::size_of::<u32>() as u32,
            )
        }
        .with_context(|| format!("Unable to move token into session {}", session))?;
    }
    Ok(duplicate)
}

/// Primary token for whatever identity the calling thread currently acts as.
pub(crate) fn effective_primary_token() -> anyhow::Result<OwnedToken> {
    let token = effective_token(TOKEN_QUERY | TOKEN_DUPLICATE)?;
    primary_token(&token, None)
}

/// `KEY=VALUE\0` pairs followed by a terminating `\0`.
pub(crate) fn environment_block(environment: &Environment) -> Vec<u16> {
    let mut block: Vec<u16> = environment
        .iter()
        .flat_map(|(key, value)| wide(&format!("{}={}", key, value)))
        .collect();
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Quotes one argument so `CommandLineToArgvW` reads it back unchanged.
pub(crate) fn quote_argument(argument: &str) -> String {
    if !argument.is_empty() && !argument.contains([' ', '\t', '\n', '"']) {
        return argument.to_string();
    }

    let mut quoted = String::from('"');
    let mut backslashes = 0usize;
    for c in argument.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            c => {
                quoted.extend(std::iter::repeat_n('\\', backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat_n('\\', backslashes * 2));
    quoted.push('"');
    quoted
}

pub(crate) struct SpawnRequest<'a> {
    pub program: &'a Path,
    pub arguments: Vec<String>,
    /// `None` inherits the environment that belongs to the token.
    pub environment: Option<&'a Environment>,
    pub desktop: Option<&'a str>,
    pub capture_output: bool,
}

pub(crate) struct UserProcess {
    process: OwnedHandle,
    id: u32,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

impl UserProcess {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn handle(&self) -> HANDLE {
        HANDLE(self.process.as_raw_handle())
    }

    /// Blocks until the process exits and returns its exit code.
    pub fn wait_blocking(&self) -> std::io::Result<u32> {
        unsafe {
            if WaitForSingleObject(self.handle(), INFINITE) == WAIT_FAILED {
                return Err(std::io::Error::last_os_error());
            }
            let mut code = 0u32;
            GetExitCodeProcess(self.handle(), &mut code)?;
            Ok(code)
        }
    }

    pub fn terminate(&self) -> std::io::Result<()> {
        unsafe { TerminateProcess(self.handle(), 1) }?;
        Ok(())
    }

    /// A second handle to the same process for waiting on another thread.
    pub fn try_clone(&self) -> std::io::Result<UserProcess> {
        Ok(UserProcess {
            process: self.process.try_clone()?,
            id: self.id,
            stdout: None,
            stderr: None,
        })
    }
}

/// Read end stays in this process, write end is inherited by the child.
fn output_pipe() -> anyhow::Result<(File, OwnedHandle)> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: true.into(),
    };
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    unsafe {
        CreatePipe(&mut read, &mut write, Some(&attributes as *const _), 0).context("CreatePipe")?;
        let read = OwnedHandle::from_raw_handle(read.0);
        let write = OwnedHandle::from_raw_handle(write.0);
        SetHandleInformation(HANDLE(read.as_raw_handle()), HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0))
            .context("SetHandleInformation")?;
        Ok((File::from(read), write))
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain([0]).collect()
}

/// Starts `request.program` running as `token`, which must be a primary token.
pub(crate) fn spawn_as(token: &OwnedToken, request: SpawnRequest<'_>) -> anyhow::Result<UserProcess> {
    let program = request.program.to_string_lossy();
    let command_line = std::iter::once(quote_argument(&program))
        .chain(request.arguments.iter().map(|argument| quote_argument(argument)))
        .collect::<Vec<_>>()
        .join(" ");
    let mut command_line = wide(&command_line);
    let environment = request.environment.map(environment_block);
    let mut desktop = request.desktop.map(wide);

    let mut startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    if let Some(desktop) = desktop.as_mut() {
        startup.lpDesktop = PWSTR(desktop.as_mut_ptr());
    }

    let (stdout, stderr, child_ends) = if request.capture_output {
        let (stdout, stdout_write) = output_pipe()?;
        let (stderr, stderr_write) = output_pipe()?;
        startup.dwFlags |= STARTF_USESTDHANDLES;
        startup.hStdOutput = HANDLE(stdout_write.as_raw_handle());
        startup.hStdError = HANDLE(stderr_write.as_raw_handle());
        (Some(stdout), Some(stderr), vec![stdout_write, stderr_write])
    } else {
        (None, None, Vec::new())
    };

    let mut information = PROCESS_INFORMATION::default();
    unsafe {
        CreateProcessAsUserW(
            token.0,
            PCWSTR::null(),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            request.capture_output,
            CREATE_UNICODE_ENVIRONMENT | CREATE_NO_WINDOW,
            environment
                .as_ref()
                .map(|block| block.as_ptr() as *const c_void),
            PCWSTR::null(),
            &startup,
            &mut information,
        )
        .with_context(|| format!("CreateProcessAsUser failed for {}", program))?;
    }
    // The child holds its own copies of the write ends now.
    drop(child_ends);

    let process = unsafe {
        drop(OwnedHandle::from_raw_handle(information.hThread.0));
        OwnedHandle::from_raw_handle(information.hProcess.0)
    };
    Ok(UserProcess {
        process,
        id: information.dwProcessId,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_argument() {
        assert_eq!(quote_argument("plain"), "plain");
        assert_eq!(quote_argument(""), "\"\"");
        assert_eq!(
            quote_argument("C:\\Program Files\\Tunnel\\ui.exe"),
            "\"C:\\Program Files\\Tunnel\\ui.exe\""
        );
        assert_eq!(quote_argument("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_argument("trailing slash\\"), "\"trailing slash\\\\\"");
    }

    #[test]
    fn test_environment_block_layout() {
        let environment = Environment::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "two".to_string()),
        ]);
        let block = environment_block(&environment);
        assert_eq!(String::from_utf16(&block).unwrap(), "A=1\0B=two\0\0");
        assert_eq!(environment_block(&Environment::new()), vec![0, 0]);
    }

    #[test]
    fn test_spawn_under_own_token_reports_exit_code() {
        let token = effective_primary_token().unwrap();
        let comspec = std::env::var("ComSpec")
            .unwrap_or_else(|_| "C:\\Windows\\System32\\cmd.exe".to_string());
        let mut process = spawn_as(
            &token,
            SpawnRequest {
                program: Path::new(&comspec),
                arguments: ["/C", "echo", "up&", "exit", "4"]
                    .map(str::to_string)
                    .to_vec(),
                environment: None,
                desktop: None,
                capture_output: true,
            },
        )
        .unwrap();

        let mut text = String::new();
        std::io::Read::read_to_string(&mut process.stdout.take().unwrap(), &mut text).unwrap();
        assert!(text.starts_with("up"));
        assert_eq!(process.wait_blocking().unwrap(), 4);
    }
}
