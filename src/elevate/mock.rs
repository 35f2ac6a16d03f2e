use crate::elevate::{ElevateError, Environment, TokenPlatform, TokenSource};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    EnableDebugPrivilege,
    Impersonate(String),
    Revert,
    DropPrivileges(Option<String>),
}

/// Records every token operation instead of performing it.
pub struct MockPlatform {
    is_system: bool,
    logon_manager_present: bool,
    debug_privilege_held: bool,
    running_services: Vec<String>,
    events: Mutex<Vec<PlatformEvent>>,
}

#[derive(Debug, Clone)]
pub struct MockToken(String);

impl MockPlatform {
    pub fn already_system() -> Self {
        Self {
            is_system: true,
            logon_manager_present: true,
            debug_privilege_held: true,
            running_services: vec!["TunnelManager".to_string()],
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn unprivileged() -> Self {
        Self {
            is_system: false,
            ..Self::already_system()
        }
    }

    pub fn without_logon_manager() -> Self {
        Self {
            logon_manager_present: false,
            ..Self::unprivileged()
        }
    }

    pub fn without_debug_privilege() -> Self {
        Self {
            debug_privilege_held: false,
            ..Self::unprivileged()
        }
    }

    pub fn events(&self) -> Vec<PlatformEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: PlatformEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl TokenPlatform for MockPlatform {
    type Token = MockToken;

    fn is_system_identity(&self) -> Result<bool, ElevateError> {
        Ok(self.is_system)
    }

    fn enable_debug_privilege(&self) -> Result<(), ElevateError> {
        self.record(PlatformEvent::EnableDebugPrivilege);
        if !self.debug_privilege_held {
            return Err(ElevateError::PrivilegeAdjustment(
                "SeDebugPrivilege is not held".to_string(),
            ));
        }
        Ok(())
    }

    fn find_identity_token(&self, source: TokenSource<'_>) -> Result<MockToken, ElevateError> {
        match source {
            TokenSource::LogonManager if self.logon_manager_present => {
                Ok(MockToken("winlogon".to_string()))
            }
            TokenSource::LogonManager => Err(ElevateError::LogonManagerNotFound),
            TokenSource::Service(name) if self.running_services.iter().any(|s| s == name) => {
                Ok(MockToken(name.to_string()))
            }
            TokenSource::Service(name) => Err(ElevateError::ServiceNotRunning(name.to_string())),
        }
    }

    fn impersonate(&self, token: &MockToken) -> Result<(), ElevateError> {
        self.record(PlatformEvent::Impersonate(token.0.clone()));
        Ok(())
    }

    fn revert(&self) -> Result<(), ElevateError> {
        self.record(PlatformEvent::Revert);
        Ok(())
    }

    fn environment_for(&self, token: Option<&MockToken>) -> Result<Environment, ElevateError> {
        let user = match token {
            Some(MockToken(name)) if name == "winlogon" => "SYSTEM".to_string(),
            Some(MockToken(name)) => name.clone(),
            None if self.is_system => "SYSTEM".to_string(),
            None => "user".to_string(),
        };
        Ok(Environment::from([("USERNAME".to_string(), user)]))
    }

    fn drop_privileges(&self, retain: Option<&str>) -> Result<(), ElevateError> {
        self.record(PlatformEvent::DropPrivileges(retain.map(str::to_string)));
        Ok(())
    }
}
