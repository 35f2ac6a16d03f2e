//! Interactive sessions as reported by the terminal services API.

use crate::elevate::user_process::{
    INTERACTIVE_DESKTOP, SpawnRequest, UserProcess, primary_token, spawn_as,
};
use crate::elevate::windows::{OwnedToken, parse_environment_block, token_information, token_is_system};
use crate::elevate::{AccountType, Environment, GroupMembership, UserIdentity};
use crate::errors;
use crate::manager::sessions::{SessionSource, UiLauncher, UiOutput, UiProcess};
use crate::manager::types::SessionId;
use anyhow::Context;
use futures_util::future::BoxFuture;
use std::path::PathBuf;
use windows::Win32::Foundation::{HANDLE, HLOCAL, LocalFree};
use windows::Win32::Security::Authorization::ConvertSidToStringSidW;
use windows::Win32::Security::{
    LookupAccountSidW, PSID, SID_AND_ATTRIBUTES, SID_NAME_USE, SidTypeUser, TOKEN_ELEVATION,
    TOKEN_GROUPS, TOKEN_LINKED_TOKEN, TOKEN_USER, TokenElevation, TokenGroups, TokenLinkedToken,
    TokenUser,
};
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::RemoteDesktop::{
    WTS_CURRENT_SERVER_HANDLE, WTS_SESSION_INFOW, WTSActive, WTSEnumerateSessionsW,
    WTSFreeMemory, WTSQueryUserToken,
};
use windows::core::{PCWSTR, PWSTR};

#[derive(Debug, Default)]
pub struct WtsSessionSource;

fn user_token(session: SessionId) -> anyhow::Result<OwnedToken> {
    let mut token = HANDLE::default();
    unsafe { WTSQueryUserToken(session.0, &mut token) }
        .with_context(|| format!("Unable to query user token of session {}", session))?;
    Ok(OwnedToken(token))
}

fn is_elevated(token: &OwnedToken) -> anyhow::Result<bool> {
    let buffer = token_information(token, TokenElevation)?;
    let elevation = unsafe { &*(buffer.as_ptr() as *const TOKEN_ELEVATION) };
    Ok(elevation.TokenIsElevated != 0)
}

/// The session user's full administrator token. A UAC-filtered logon hands
/// out its linked token instead.
fn elevated_user_token(session: SessionId) -> anyhow::Result<OwnedToken> {
    let token = user_token(session)?;
    if is_elevated(&token)? {
        return Ok(token);
    }
    let buffer = token_information(&token, TokenLinkedToken)
        .with_context(|| format!("Unable to elevate token of session {}", session))?;
    let linked = unsafe { &*(buffer.as_ptr() as *const TOKEN_LINKED_TOKEN) };
    let linked = OwnedToken(linked.LinkedToken);
    anyhow::ensure!(
        is_elevated(&linked)?,
        "Linked token of session {} is not elevated",
        session
    );
    Ok(linked)
}

fn sid_to_string(sid: PSID) -> anyhow::Result<String> {
    unsafe {
        let mut raw = PWSTR::null();
        ConvertSidToStringSidW(sid, &mut raw).context("ConvertSidToStringSid")?;
        let text = raw.to_string();
        let _ = LocalFree(HLOCAL(raw.0.cast()));
        Ok(text?)
    }
}

fn groups_of(token: &OwnedToken) -> anyhow::Result<Vec<GroupMembership>> {
    let buffer = token_information(token, TokenGroups)?;
    unsafe {
        let groups = &*(buffer.as_ptr() as *const TOKEN_GROUPS);
        let entries = std::slice::from_raw_parts(
            groups.Groups.as_ptr() as *const SID_AND_ATTRIBUTES,
            groups.GroupCount as usize,
        );
        entries
            .iter()
            .map(|entry| Ok(GroupMembership::new(sid_to_string(entry.Sid)?, entry.Attributes)))
            .collect()
    }
}

fn linked_groups_of(token: &OwnedToken) -> Option<Vec<GroupMembership>> {
    let buffer = token_information(token, TokenLinkedToken).ok()?;
    let linked = unsafe { &*(buffer.as_ptr() as *const TOKEN_LINKED_TOKEN) };
    let linked = OwnedToken(linked.LinkedToken);
    groups_of(&linked).ok()
}

fn account_of(token: &OwnedToken) -> anyhow::Result<(String, AccountType)> {
    if token_is_system(token)? {
        return Ok(("SYSTEM".to_string(), AccountType::System));
    }

    let buffer = token_information(token, TokenUser)?;
    unsafe {
        let user = &*(buffer.as_ptr() as *const TOKEN_USER);
        let mut name = [0u16; 256];
        let mut name_len = name.len() as u32;
        let mut domain = [0u16; 256];
        let mut domain_len = domain.len() as u32;
        let mut kind = SID_NAME_USE::default();
        LookupAccountSidW(
            PCWSTR::null(),
            user.User.Sid,
            PWSTR(name.as_mut_ptr()),
            &mut name_len,
            PWSTR(domain.as_mut_ptr()),
            &mut domain_len,
            &mut kind,
        )
        .context("LookupAccountSid")?;

        let username = String::from_utf16_lossy(&name[..name_len as usize]);
        let account_type = match kind {
            SidTypeUser => AccountType::User,
            _ => AccountType::Service,
        };
        Ok((username, account_type))
    }
}

impl SessionSource for WtsSessionSource {
    fn active_sessions(&self) -> anyhow::Result<Vec<SessionId>> {
        unsafe {
            let mut sessions: *mut WTS_SESSION_INFOW = std::ptr::null_mut();
            let mut count = 0u32;
            WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut sessions, &mut count)
                .context("WTSEnumerateSessions")?;
            let active = std::slice::from_raw_parts(sessions, count as usize)
                .iter()
                .filter(|session| session.State == WTSActive)
                .map(|session| SessionId(session.SessionId))
                .collect();
            WTSFreeMemory(sessions.cast());
            Ok(active)
        }
    }

    fn user_identity(&self, session: SessionId) -> anyhow::Result<UserIdentity> {
        let token = user_token(session)?;
        let (username, account_type) = account_of(&token)?;
        Ok(UserIdentity {
            username,
            account_type,
            groups: groups_of(&token)?,
            linked_groups: linked_groups_of(&token),
        })
    }

    fn user_environment(&self, session: SessionId) -> anyhow::Result<Environment> {
        let token = user_token(session)?;
        unsafe {
            let mut block = std::ptr::null_mut();
            CreateEnvironmentBlock(&mut block, token.0, false).context("CreateEnvironmentBlock")?;
            let environment = parse_environment_block(block as *const u16);
            let _ = DestroyEnvironmentBlock(block);
            Ok(environment)
        }
    }
}

/// Starts the UI inside the user's session, on the interactive desktop, with
/// the user's elevated token. Only administrators get a UI, and the control
/// pipe admits administrators only.
pub struct WtsUiLauncher {
    command: PathBuf,
    socket_path: PathBuf,
}

impl WtsUiLauncher {
    pub fn new(command: PathBuf, socket_path: PathBuf) -> Self {
        Self {
            command,
            socket_path,
        }
    }
}

impl UiLauncher for WtsUiLauncher {
    fn launch(
        &self,
        session: SessionId,
        identity: &UserIdentity,
        environment: &Environment,
    ) -> anyhow::Result<Box<dyn UiProcess>> {
        tracing::info!(
            "Launching UI as '{}' in session {}: {}",
            identity.username,
            session,
            self.command.display()
        );
        let token = primary_token(&elevated_user_token(session)?, Some(session.0))?;
        let process = spawn_as(
            &token,
            SpawnRequest {
                program: &self.command,
                arguments: vec![
                    "--session".to_string(),
                    session.to_string(),
                    "--socket".to_string(),
                    self.socket_path.to_string_lossy().into_owned(),
                ],
                environment: Some(environment),
                desktop: Some(INTERACTIVE_DESKTOP),
                capture_output: true,
            },
        )
        .map_err(|e| {
            anyhow::anyhow!(errors::process::spawn_failed(&format!(
                "{}: {:#}",
                self.command.display(),
                e
            )))
        })?;
        Ok(Box::new(SessionProcess::new(process)))
    }
}

/// A [`UserProcess`] that is terminated when dropped.
struct SessionProcess {
    process: UserProcess,
    exited: bool,
}

impl SessionProcess {
    fn new(process: UserProcess) -> Self {
        Self {
            process,
            exited: false,
        }
    }
}

impl UiProcess for SessionProcess {
    fn id(&self) -> u32 {
        self.process.id()
    }

    fn take_output(&mut self) -> Option<UiOutput> {
        let stdout = self.process.stdout.take()?;
        let stderr = self.process.stderr.take()?;
        Some((
            Box::new(tokio::fs::File::from_std(stdout)),
            Box::new(tokio::fs::File::from_std(stderr)),
        ))
    }

    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<u32>>> {
        Box::pin(async move {
            let waiter = self.process.try_clone()?;
            let code = tokio::task::spawn_blocking(move || waiter.wait_blocking())
                .await
                .map_err(std::io::Error::other)??;
            self.exited = true;
            Ok(Some(code))
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, std::io::Result<()>> {
        Box::pin(async move {
            self.process.terminate()?;
            self.wait().await.map(|_| ())
        })
    }
}

impl Drop for SessionProcess {
    fn drop(&mut self) {
        if !self.exited {
            let _ = self.process.terminate();
        }
    }
}
