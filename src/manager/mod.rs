//! The privileged manager: tunnel lifecycle, notifications and per-session
//! UI supervision.

pub mod control;
pub mod notifier;
pub mod service;
pub mod sessions;
pub mod tracker;
pub mod types;
#[cfg(windows)]
pub mod wts;

pub use control::{ControlOptions, run_control_loop};
pub use notifier::NotifierRegistry;
pub use service::ManagerService;
pub use sessions::SessionSupervisor;
pub use tracker::TunnelTracker;
pub use types::{
    ConnectionId, Notification, NotifierId, SessionId, Tunnel, TunnelState, UpdateState,
};
