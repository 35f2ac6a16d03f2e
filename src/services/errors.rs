use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Closed set of setup failures. The discriminant is the process exit code
/// reported by the manager and by tunnel workers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::EnumIter, thiserror::Error,
)]
#[repr(u32)]
pub enum ServiceError {
    #[error("No error")]
    Success = 0,
    #[error("Unable to open log file")]
    RingloggerOpen,
    #[error("Unable to load configuration from path")]
    LoadConfiguration,
    #[error("Unable to create network adapter")]
    CreateAdapter,
    #[error("Unable to listen on named pipe")]
    UapiListen,
    #[error("Unable to resolve one or more DNS hostname endpoints")]
    DnsLookup,
    #[error("Unable to enable firewall rules")]
    Firewall,
    #[error("Unable to set device configuration")]
    DeviceSetConfig,
    #[error("Unable to bind sockets to default route")]
    BindSocketsToDefaultRoutes,
    #[error("Unable to set interface addresses, routes, dns, and/or interface settings")]
    SetNetConfig,
    #[error("Unable to determine path of running executable")]
    DetermineExecutablePath,
    #[error("Unable to create security descriptor")]
    CreateSecurityDescriptor,
    #[error("Unable to open NUL file")]
    OpenNulFile,
    #[error("Unable to track existing tunnels")]
    TrackTunnels,
    #[error("Unable to enumerate current sessions")]
    EnumerateSessions,
    #[error("Unable to drop privileges")]
    DropPrivileges,
    #[error("An error occurred while running a configuration script command")]
    RunScript,
    #[error("An internal Windows error has occurred")]
    Win32,
}

impl ServiceError {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::iter().find(|e| e.code() == code)
    }
}

/// A setup failure together with the context that caused it.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {cause:#}")]
pub struct ServiceFailure {
    pub kind: ServiceError,
    pub cause: anyhow::Error,
}

impl ServiceFailure {
    pub fn new(kind: ServiceError, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    pub fn exit_code(&self) -> u32 {
        self.kind.code()
    }
}

pub trait ServiceResultExt<T> {
    fn service_err(self, kind: ServiceError) -> Result<T, ServiceFailure>;
}

impl<T, E> ServiceResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn service_err(self, kind: ServiceError) -> Result<T, ServiceFailure> {
        self.map_err(|e| ServiceFailure::new(kind, e))
    }
}

/// How a worker's service last exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerExit {
    Clean,
    NeverStarted,
    ServiceSpecific(u32),
    System(u32),
    Terminated,
}

impl WorkerExit {
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => WorkerExit::Clean,
            Some(code) => WorkerExit::ServiceSpecific(code as u32),
            None => WorkerExit::Terminated,
        }
    }

    /// Clean exits and services that never started carry no error.
    pub fn error_message(&self) -> Option<String> {
        match *self {
            WorkerExit::Clean | WorkerExit::NeverStarted => None,
            WorkerExit::ServiceSpecific(code) => Some(match ServiceError::from_code(code) {
                Some(ServiceError::Success) => return None,
                Some(kind) => kind.to_string(),
                None => format!("Unknown service error code {}", code),
            }),
            WorkerExit::System(code) => {
                Some(std::io::Error::from_raw_os_error(code as i32).to_string())
            }
            WorkerExit::Terminated => Some("Tunnel process was terminated".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ServiceError::Success.code(), 0);
        assert_eq!(ServiceError::LoadConfiguration.code(), 2);
        assert_eq!(ServiceError::Firewall.code(), 6);
        assert_eq!(ServiceError::RunScript.code(), 16);
        assert_eq!(ServiceError::Win32.code(), 17);
    }

    #[test]
    fn test_from_code_round_trips() {
        for kind in ServiceError::iter() {
            assert_eq!(ServiceError::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ServiceError::from_code(777), None);
    }

    #[test]
    fn test_exit_decoding() {
        assert_eq!(WorkerExit::Clean.error_message(), None);
        assert_eq!(WorkerExit::NeverStarted.error_message(), None);
        assert_eq!(WorkerExit::ServiceSpecific(0).error_message(), None);
        assert_eq!(
            WorkerExit::ServiceSpecific(ServiceError::Firewall.code()).error_message(),
            Some("Unable to enable firewall rules".to_string())
        );
        assert!(
            WorkerExit::ServiceSpecific(777)
                .error_message()
                .unwrap()
                .contains("777")
        );
        assert!(WorkerExit::Terminated.error_message().is_some());
    }

    #[test]
    fn test_from_exit_code() {
        assert_eq!(WorkerExit::from_exit_code(Some(0)), WorkerExit::Clean);
        assert_eq!(
            WorkerExit::from_exit_code(Some(6)),
            WorkerExit::ServiceSpecific(6)
        );
        assert_eq!(WorkerExit::from_exit_code(None), WorkerExit::Terminated);
    }

    #[test]
    fn test_failure_display_includes_cause() {
        let failure = Err::<(), _>(anyhow::anyhow!("file missing"))
            .service_err(ServiceError::LoadConfiguration)
            .unwrap_err();
        assert_eq!(failure.exit_code(), 2);
        let text = failure.to_string();
        assert!(text.contains("Unable to load configuration"));
        assert!(text.contains("file missing"));
    }
}
