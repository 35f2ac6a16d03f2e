use crate::elevate::{ElevateError, Environment, TokenPlatform, TokenSource};
use std::convert::Infallible;

/// Root is the system identity. Per-thread impersonation does not exist on
/// unix, so switching to another identity is refused.
#[derive(Debug, Default)]
pub struct UnixPlatform;

impl TokenPlatform for UnixPlatform {
    type Token = Infallible;

    fn is_system_identity(&self) -> Result<bool, ElevateError> {
        Ok(nix::unistd::geteuid().is_root())
    }

    fn enable_debug_privilege(&self) -> Result<(), ElevateError> {
        Err(ElevateError::PrivilegeAdjustment(
            "running as root is required".to_string(),
        ))
    }

    fn find_identity_token(&self, source: TokenSource<'_>) -> Result<Infallible, ElevateError> {
        match source {
            TokenSource::LogonManager => Err(ElevateError::Unsupported),
            TokenSource::Service(name) => Err(ElevateError::ServiceNotRunning(name.to_string())),
        }
    }

    fn impersonate(&self, token: &Infallible) -> Result<(), ElevateError> {
        match *token {}
    }

    fn revert(&self) -> Result<(), ElevateError> {
        Ok(())
    }

    fn environment_for(&self, token: Option<&Infallible>) -> Result<Environment, ElevateError> {
        if let Some(token) = token {
            match *token {}
        }
        Ok(std::env::vars().collect())
    }

    fn drop_privileges(&self, retain: Option<&str>) -> Result<(), ElevateError> {
        if let Some(privilege) = retain {
            tracing::debug!("Privilege '{}' has no unix equivalent, ignoring", privilege);
        }

        #[cfg(target_os = "linux")]
        {
            if nix::unistd::geteuid().is_root() {
                nix::unistd::setgroups(&[]).map_err(|e| {
                    ElevateError::PrivilegeAdjustment(format!(
                        "unable to clear supplementary groups: {}",
                        e
                    ))
                })?;
            }
            nix::sys::prctl::set_no_new_privs().map_err(|e| {
                ElevateError::PrivilegeAdjustment(format!("unable to set no_new_privs: {}", e))
            })?;
        }

        Ok(())
    }
}
