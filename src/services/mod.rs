//! Service-control layer. Every tunnel worker is exposed as a service object
//! whose status the manager observes but never asserts.

pub mod errors;
pub mod mock;
pub mod names;
mod object;
pub mod process;

use crate::conf::name::TunnelName;
use errors::WorkerExit;
use std::path::Path;

pub use errors::{ServiceError, ServiceFailure, ServiceResultExt};
pub use mock::MockServiceManager;
pub use names::{pipe_path_of_tunnel, service_name_of_tunnel};
pub use process::ProcessServiceManager;

/// Status-change notification bits, as delivered by the service controller.
pub mod notify_bits {
    pub const STOPPED: u32 = 0x0000_0001;
    pub const START_PENDING: u32 = 0x0000_0002;
    pub const STOP_PENDING: u32 = 0x0000_0004;
    pub const RUNNING: u32 = 0x0000_0008;
    pub const DELETE_PENDING: u32 = 0x0000_0200;

    pub const TRACKED: u32 = STOPPED | START_PENDING | STOP_PENDING | RUNNING | DELETE_PENDING;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    StartPending,
    Running,
    StopPending,
    Stopped(WorkerExit),
    DeletePending,
}

impl ServiceStatus {
    pub fn notify_bits(&self) -> u32 {
        match self {
            ServiceStatus::StartPending => notify_bits::START_PENDING,
            ServiceStatus::Running => notify_bits::RUNNING,
            ServiceStatus::StopPending => notify_bits::STOP_PENDING,
            ServiceStatus::Stopped(_) => notify_bits::STOPPED,
            ServiceStatus::DeletePending => notify_bits::DELETE_PENDING,
        }
    }

    pub fn exit(&self) -> WorkerExit {
        match self {
            ServiceStatus::Stopped(exit) => *exit,
            _ => WorkerExit::Clean,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub notified: u32,
    pub exit: WorkerExit,
}

impl From<ServiceStatus> for StatusChange {
    fn from(status: ServiceStatus) -> Self {
        Self {
            notified: status.notify_bits(),
            exit: status.exit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Changed(StatusChange),
    /// The service object is gone or about to be.
    MarkedForDelete,
    /// Notifications were dropped; the caller should simply wait again.
    Lagging,
    Failed(String),
}

/// Blocking status subscription for one service. Lives on a dedicated thread.
pub trait ServiceWatcher: Send {
    fn wait(&mut self) -> WaitOutcome;
    fn request_stop(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceControlError {
    #[error("The service for tunnel '{0}' does not exist")]
    DoesNotExist(TunnelName),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait ServiceManager: Send + Sync {
    /// Registers and starts the worker for `name`. Installing a tunnel whose
    /// service is still live is a no-op.
    fn install_tunnel(&self, config_path: &Path, name: &TunnelName)
    -> Result<(), ServiceControlError>;

    /// Asks the worker to stop; its service object disappears once it has.
    fn uninstall_tunnel(&self, name: &TunnelName) -> Result<(), ServiceControlError>;

    /// `None` means no service exists for the tunnel.
    fn query_status(&self, name: &TunnelName) -> Option<ServiceStatus>;

    fn open_watcher(
        &self,
        name: &TunnelName,
    ) -> Result<Box<dyn ServiceWatcher>, ServiceControlError>;

    fn uninstall_manager(&self) -> anyhow::Result<()>;
}
