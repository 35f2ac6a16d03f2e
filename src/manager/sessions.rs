//! One UI process per interactive administrator session.

use crate::elevate::{Environment, UserIdentity};
use crate::errors;
use crate::manager::types::SessionId;
use crate::process_log::capture_output;
use crate::services::{ServiceError, ServiceFailure, ServiceResultExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use futures_util::future::BoxFuture;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause between two UI launches in the same session.
pub const RELAUNCH_DELAY: Duration = Duration::from_secs(1);

pub const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// STATUS_DLL_INIT_FAILED_LOGOFF: the session went away under the process.
pub const SESSION_LOGGED_OFF_EXIT_CODE: u32 = 0xC000_026B;

pub trait SessionSource: Send + Sync + 'static {
    fn active_sessions(&self) -> anyhow::Result<Vec<SessionId>>;
    fn user_identity(&self, session: SessionId) -> anyhow::Result<UserIdentity>;
    /// The logged-on user's own environment, not the manager's.
    fn user_environment(&self, session: SessionId) -> anyhow::Result<Environment>;
}

pub type UiOutput = (
    Box<dyn AsyncRead + Unpin + Send>,
    Box<dyn AsyncRead + Unpin + Send>,
);

/// A running UI process, however it was created.
pub trait UiProcess: Send {
    fn id(&self) -> u32;
    /// The stdout and stderr pipes. `None` once taken.
    fn take_output(&mut self) -> Option<UiOutput>;
    /// Resolves to the exit code, `None` when the process died from a signal.
    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<u32>>>;
    fn kill(&mut self) -> BoxFuture<'_, std::io::Result<()>>;
}

impl UiProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self).unwrap_or_default()
    }

    fn take_output(&mut self) -> Option<UiOutput> {
        let stdout = self.stdout.take()?;
        let stderr = self.stderr.take()?;
        Some((Box::new(stdout), Box::new(stderr)))
    }

    fn wait(&mut self) -> BoxFuture<'_, std::io::Result<Option<u32>>> {
        Box::pin(async move {
            let status = Child::wait(self).await?;
            Ok(status.code().map(|code| code as u32))
        })
    }

    fn kill(&mut self) -> BoxFuture<'_, std::io::Result<()>> {
        Box::pin(Child::kill(self))
    }
}

pub trait UiLauncher: Send + Sync + 'static {
    /// Starts the UI inside `session` running as `identity`.
    fn launch(
        &self,
        session: SessionId,
        identity: &UserIdentity,
        environment: &Environment,
    ) -> anyhow::Result<Box<dyn UiProcess>>;
}

/// Starts the configured UI command as a child of the manager with the
/// session's environment. The child keeps the manager's own identity, so
/// this is only for unix and mock mode. The UI reaches the manager through
/// the control socket passed on its command line.
pub struct CommandUiLauncher {
    command: PathBuf,
    socket_path: PathBuf,
}

impl CommandUiLauncher {
    pub fn new(command: PathBuf, socket_path: PathBuf) -> Self {
        Self {
            command,
            socket_path,
        }
    }
}

impl UiLauncher for CommandUiLauncher {
    fn launch(
        &self,
        session: SessionId,
        identity: &UserIdentity,
        environment: &Environment,
    ) -> anyhow::Result<Box<dyn UiProcess>> {
        tracing::info!(
            "Launching UI for '{}' in session {}: {}",
            identity.username,
            session,
            self.command.display()
        );
        let child = Command::new(&self.command)
            .arg("--session")
            .arg(session.to_string())
            .arg("--socket")
            .arg(&self.socket_path)
            .env_clear()
            .envs(environment)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                anyhow::anyhow!(errors::process::spawn_failed(&format!(
                    "{}: {}",
                    self.command.display(),
                    e
                )))
            })?;
        Ok(Box::new(child))
    }
}

/// Sessions whose state is set by hand. Used in mock mode and tests.
#[derive(Default)]
pub struct MockSessionSource {
    sessions: Mutex<BTreeMap<SessionId, UserIdentity>>,
    fail_enumeration: AtomicBool,
}

impl MockSessionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_on(&self, session: SessionId, identity: UserIdentity) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session, identity);
    }

    pub fn log_off(&self, session: SessionId) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }
}

impl SessionSource for MockSessionSource {
    fn active_sessions(&self) -> anyhow::Result<Vec<SessionId>> {
        anyhow::ensure!(
            !self.fail_enumeration.load(Ordering::SeqCst),
            "Mock: session enumeration failed"
        );
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect())
    }

    fn user_identity(&self, session: SessionId) -> anyhow::Result<UserIdentity> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!(errors::session::LOGGED_OUT))
    }

    fn user_environment(&self, session: SessionId) -> anyhow::Result<Environment> {
        let identity = self.user_identity(session)?;
        let mut environment = Environment::new();
        environment.insert("USERNAME".to_string(), identity.username);
        if let Ok(path) = std::env::var("PATH") {
            environment.insert("PATH".to_string(), path);
        }
        Ok(environment)
    }
}

struct SessionEntry {
    logged_out: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub struct SessionSupervisor {
    source: Arc<dyn SessionSource>,
    launcher: Arc<dyn UiLauncher>,
    log_directory: PathBuf,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    stopping: AtomicBool,
    relaunch_delay: Duration,
}

impl SessionSupervisor {
    pub fn new(
        source: Arc<dyn SessionSource>,
        launcher: Arc<dyn UiLauncher>,
        log_directory: PathBuf,
    ) -> Self {
        Self {
            source,
            launcher,
            log_directory,
            sessions: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            relaunch_delay: RELAUNCH_DELAY,
        }
    }

    pub fn with_relaunch_delay(mut self, delay: Duration) -> Self {
        self.relaunch_delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self.lock().keys().copied().collect();
        sessions.sort();
        sessions
    }

    /// Services every session that is active right now. Failing to
    /// enumerate is fatal to manager startup.
    pub fn start(self: &Arc<Self>) -> Result<(), ServiceFailure> {
        let sessions = self
            .source
            .active_sessions()
            .service_err(ServiceError::EnumerateSessions)?;
        for session in sessions {
            self.log_on(session);
        }
        Ok(())
    }

    /// Follows logons and logoffs until `shutdown` fires.
    pub async fn watch_sessions(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let active: HashSet<SessionId> = match self.source.active_sessions() {
                Ok(sessions) => sessions.into_iter().collect(),
                Err(e) => {
                    tracing::warn!("Unable to enumerate sessions: {:#}", e);
                    continue;
                }
            };
            let known: HashSet<SessionId> = self.lock().keys().copied().collect();

            for session in active.difference(&known) {
                self.log_on(*session);
            }
            for session in known.difference(&active) {
                self.log_off(*session);
            }
        }
    }

    pub fn log_on(self: &Arc<Self>, session: SessionId) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let mut sessions = self.lock();
        if sessions.contains_key(&session) {
            return;
        }

        tracing::info!("Session {} logged on", session);
        let logged_out = CancellationToken::new();
        let task = tokio::spawn(self.clone().supervise(session, logged_out.clone()));
        sessions.insert(
            session,
            SessionEntry {
                logged_out,
                task: Some(task),
            },
        );
    }

    /// Forgets the session and kills its UI process if one is running.
    pub fn log_off(&self, session: SessionId) {
        if let Some(entry) = self.lock().remove(&session) {
            tracing::info!("Session {} logged off", session);
            entry.logged_out.cancel();
        }
    }

    /// Kills every UI process and waits for the supervisors to finish.
    pub async fn drain(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let entries: Vec<SessionEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            entry.logged_out.cancel();
        }
        for mut entry in entries {
            if let Some(task) = entry.task.take() {
                let _ = task.await;
            }
        }
    }

    async fn supervise(self: Arc<Self>, session: SessionId, logged_out: CancellationToken) {
        loop {
            let mut process = match self.spawn_ui(session, &logged_out) {
                Ok(Some(process)) => process,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!("Unable to start UI in session {}: {:#}", session, e);
                    return;
                }
            };

            match process.take_output() {
                Some((stdout, stderr)) => {
                    let capture = capture_output(
                        stdout,
                        stderr,
                        process.id(),
                        &self.log_directory,
                        &format!("ui-session-{}", session),
                        logged_out.child_token(),
                        |_| {},
                    )
                    .await;
                    if let Err(e) = capture {
                        tracing::warn!("Not capturing UI output in session {}: {:#}", session, e);
                    }
                }
                None => tracing::warn!("UI process in session {} has no output pipes", session),
            }

            let status = tokio::select! {
                status = process.wait() => status,
                _ = logged_out.cancelled() => {
                    tracing::info!("Terminating UI process in session {}", session);
                    if let Err(e) = process.kill().await {
                        tracing::warn!("Unable to kill UI process in session {}: {}", session, e);
                    }
                    return;
                }
            };

            match status {
                Ok(Some(SESSION_LOGGED_OFF_EXIT_CODE)) => {
                    tracing::info!("Session {} is gone, not relaunching UI", session);
                    return;
                }
                Ok(Some(code)) => {
                    tracing::info!("UI process in session {} exited with code {}", session, code)
                }
                Ok(None) => tracing::info!("UI process in session {} was terminated", session),
                Err(e) => tracing::warn!("Unable to wait for UI in session {}: {}", session, e),
            }

            tokio::select! {
                _ = logged_out.cancelled() => return,
                _ = tokio::time::sleep(self.relaunch_delay) => {}
            }
        }
    }

    /// `Ok(None)` when the session's user may not run the UI.
    fn spawn_ui(
        &self,
        session: SessionId,
        logged_out: &CancellationToken,
    ) -> anyhow::Result<Option<Box<dyn UiProcess>>> {
        let identity = self.source.user_identity(session)?;
        if !identity.may_run_ui() {
            tracing::info!(
                "User '{}' in session {} is not an administrator, not starting UI",
                identity.username,
                session
            );
            return Ok(None);
        }
        let environment = self.source.user_environment(session)?;

        // A logoff takes the same lock, so it either happened already or
        // will see the child once it exists.
        let sessions = self.lock();
        anyhow::ensure!(
            !logged_out.is_cancelled() && sessions.contains_key(&session),
            errors::session::LOGGED_OUT
        );
        let process = self.launcher.launch(session, &identity, &environment)?;
        drop(sessions);
        Ok(Some(process))
    }
}
