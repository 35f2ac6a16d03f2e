//! Running closures under a more privileged identity.

pub mod membership;
pub mod mock;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) mod user_process;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

pub use membership::{AccountType, GroupMembership, UserIdentity};

/// Environment block of an identity. Passed explicitly to children started
/// under that identity instead of touching the process environment.
pub type Environment = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ElevateError {
    #[error("Unable to find logon manager process")]
    LogonManagerNotFound,
    #[error("Unable to find running process for service '{0}'")]
    ServiceNotRunning(String),
    #[error("Unable to adjust privileges: {0}")]
    PrivilegeAdjustment(String),
    #[error("Privileges have already been dropped")]
    AlreadyDropped,
    #[error("Identity impersonation is not supported on this platform")]
    Unsupported,
    #[error("{context}: {source}")]
    Os {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Elevated callback panicked")]
    Panicked,
}

impl ElevateError {
    pub fn os(context: &'static str, source: impl Into<std::io::Error>) -> Self {
        ElevateError::Os {
            context,
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource<'a> {
    LogonManager,
    Service(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    System,
    Service(String),
}

/// The OS-specific half of identity switching. Every method other than
/// [`TokenPlatform::drop_privileges`] acts on the calling thread only.
pub trait TokenPlatform: Send + Sync {
    type Token: Send;

    /// Whether the calling thread's effective identity is the system account.
    fn is_system_identity(&self) -> Result<bool, ElevateError>;
    /// Enables the debug privilege on a thread-local copy of the process
    /// identity. [`TokenPlatform::revert`] discards it.
    fn enable_debug_privilege(&self) -> Result<(), ElevateError>;
    fn find_identity_token(&self, source: TokenSource<'_>) -> Result<Self::Token, ElevateError>;
    fn impersonate(&self, token: &Self::Token) -> Result<(), ElevateError>;
    fn revert(&self) -> Result<(), ElevateError>;
    /// `None` asks for the environment of the current identity.
    fn environment_for(&self, token: Option<&Self::Token>) -> Result<Environment, ElevateError>;
    fn drop_privileges(&self, retain: Option<&str>) -> Result<(), ElevateError>;
}

/// Scoped proof that the current thread runs as an elevated identity.
/// Reverts impersonation when dropped and cannot leave its thread.
pub struct ElevatedContext<'a> {
    identity: Identity,
    environment: Environment,
    revert: Option<Box<dyn FnOnce() + 'a>>,
}

impl ElevatedContext<'_> {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }
}

impl Drop for ElevatedContext<'_> {
    fn drop(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert();
        }
    }
}

pub struct PrivilegeBroker<P: TokenPlatform> {
    platform: P,
    privileges_dropped: AtomicBool,
}

impl<P: TokenPlatform> PrivilegeBroker<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            privileges_dropped: AtomicBool::new(false),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Runs `f` as the system identity on a dedicated OS thread. Impersonation
    /// is reverted on every exit path, including a panicking callback.
    pub fn with_system_identity<F, T>(&self, f: F) -> Result<T, ElevateError>
    where
        F: FnOnce(&ElevatedContext<'_>) -> T + Send,
        T: Send,
    {
        self.run_pinned(None, f)
    }

    /// Like [`Self::with_system_identity`], then switches to the identity of
    /// the process running `service_name`.
    pub fn with_service_identity<F, T>(&self, service_name: &str, f: F) -> Result<T, ElevateError>
    where
        F: FnOnce(&ElevatedContext<'_>) -> T + Send,
        T: Send,
    {
        self.run_pinned(Some(service_name), f)
    }

    /// Irreversibly strips every privilege except `retain`. Only the first
    /// call has any effect.
    pub fn drop_all_privileges(&self, retain: Option<&str>) -> Result<(), ElevateError> {
        if self
            .privileges_dropped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ElevateError::AlreadyDropped);
        }
        self.platform.drop_privileges(retain)?;
        match retain {
            Some(privilege) => tracing::info!("Dropped all privileges except '{}'", privilege),
            None => tracing::info!("Dropped all privileges"),
        }
        Ok(())
    }

    fn run_pinned<F, T>(&self, service_name: Option<&str>, f: F) -> Result<T, ElevateError>
    where
        F: FnOnce(&ElevatedContext<'_>) -> T + Send,
        T: Send,
    {
        std::thread::scope(|scope| {
            scope
                .spawn(|| self.run_on_current_thread(service_name, f))
                .join()
                .map_err(|_| ElevateError::Panicked)?
        })
    }

    fn run_on_current_thread<F, T>(&self, service_name: Option<&str>, f: F) -> Result<T, ElevateError>
    where
        F: FnOnce(&ElevatedContext<'_>) -> T,
    {
        let platform = &self.platform;
        let mut impersonating = false;
        let revert = move || {
            if let Err(e) = platform.revert() {
                tracing::error!("Unable to revert impersonation: {}", e);
            }
        };

        // Anything that fails once the thread token is touched still reverts.
        let mut context = ElevatedContext {
            identity: Identity::System,
            environment: Environment::new(),
            revert: None,
        };

        if !platform.is_system_identity()? {
            context.revert = Some(Box::new(revert));
            impersonating = true;
            platform.enable_debug_privilege()?;
            let system_token = platform.find_identity_token(TokenSource::LogonManager)?;
            platform.impersonate(&system_token)?;
            context.environment = platform.environment_for(Some(&system_token))?;
        }

        match service_name {
            Some(service_name) => {
                let service_token =
                    platform.find_identity_token(TokenSource::Service(service_name))?;
                platform.impersonate(&service_token)?;
                if !impersonating {
                    context.revert = Some(Box::new(revert));
                }
                context.identity = Identity::Service(service_name.to_string());
                context.environment = platform.environment_for(Some(&service_token))?;
            }
            None if !impersonating => {
                context.environment = platform.environment_for(None)?;
            }
            None => {}
        }

        Ok(f(&context))
    }
}

#[cfg(unix)]
pub type NativePlatform = unix::UnixPlatform;
#[cfg(windows)]
pub type NativePlatform = windows::WindowsPlatform;

pub fn native_broker() -> PrivilegeBroker<NativePlatform> {
    PrivilegeBroker::new(NativePlatform::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock::{MockPlatform, PlatformEvent};

    #[test]
    fn test_system_identity_runs_directly() {
        let broker = PrivilegeBroker::new(MockPlatform::already_system());
        let value = broker
            .with_system_identity(|ctx| {
                assert_eq!(ctx.identity(), &Identity::System);
                42
            })
            .unwrap();
        assert_eq!(value, 42);
        assert!(broker.platform().events().is_empty());
    }

    #[test]
    fn test_impersonation_reverted_after_callback() {
        let broker = PrivilegeBroker::new(MockPlatform::unprivileged());
        broker
            .with_system_identity(|ctx| {
                assert_eq!(ctx.environment().get("USERNAME").unwrap(), "SYSTEM");
            })
            .unwrap();
        assert_eq!(
            broker.platform().events(),
            vec![
                PlatformEvent::EnableDebugPrivilege,
                PlatformEvent::Impersonate("winlogon".to_string()),
                PlatformEvent::Revert,
            ]
        );
    }

    #[test]
    fn test_impersonation_reverted_after_panic() {
        let broker = PrivilegeBroker::new(MockPlatform::unprivileged());
        let result: Result<(), _> = broker.with_system_identity(|_| panic!("boom"));
        assert!(matches!(result, Err(ElevateError::Panicked)));
        assert_eq!(
            broker.platform().events().last(),
            Some(&PlatformEvent::Revert)
        );
    }

    #[test]
    fn test_missing_logon_manager_is_fatal() {
        let broker = PrivilegeBroker::new(MockPlatform::without_logon_manager());
        let result = broker.with_system_identity(|_| ());
        assert!(matches!(result, Err(ElevateError::LogonManagerNotFound)));
        assert_eq!(
            broker.platform().events(),
            vec![PlatformEvent::EnableDebugPrivilege, PlatformEvent::Revert]
        );
    }

    #[test]
    fn test_debug_privilege_failure_reverts_thread() {
        let broker = PrivilegeBroker::new(MockPlatform::without_debug_privilege());
        let result = broker.with_system_identity(|_| ());
        assert!(matches!(result, Err(ElevateError::PrivilegeAdjustment(_))));
        assert_eq!(
            broker.platform().events(),
            vec![PlatformEvent::EnableDebugPrivilege, PlatformEvent::Revert]
        );
    }

    #[test]
    fn test_service_identity_nests_inside_system() {
        let broker = PrivilegeBroker::new(MockPlatform::unprivileged());
        broker
            .with_service_identity("TunnelManager", |ctx| {
                assert_eq!(ctx.identity(), &Identity::Service("TunnelManager".to_string()));
                assert_eq!(ctx.environment().get("USERNAME").unwrap(), "TunnelManager");
            })
            .unwrap();
        assert_eq!(
            broker.platform().events(),
            vec![
                PlatformEvent::EnableDebugPrivilege,
                PlatformEvent::Impersonate("winlogon".to_string()),
                PlatformEvent::Impersonate("TunnelManager".to_string()),
                PlatformEvent::Revert,
            ]
        );
    }

    #[test]
    fn test_unknown_service_reverts_system_impersonation() {
        let broker = PrivilegeBroker::new(MockPlatform::unprivileged());
        let result = broker.with_service_identity("Missing", |_| ());
        assert!(matches!(result, Err(ElevateError::ServiceNotRunning(_))));
        assert_eq!(
            broker.platform().events().last(),
            Some(&PlatformEvent::Revert)
        );
    }

    #[test]
    fn test_drop_privileges_only_once() {
        let broker = PrivilegeBroker::new(MockPlatform::already_system());
        broker
            .drop_all_privileges(Some("SeLoadDriverPrivilege"))
            .unwrap();
        assert!(matches!(
            broker.drop_all_privileges(None),
            Err(ElevateError::AlreadyDropped)
        ));
        assert_eq!(
            broker.platform().events(),
            vec![PlatformEvent::DropPrivileges(Some(
                "SeLoadDriverPrivilege".to_string()
            ))]
        );
    }
}
