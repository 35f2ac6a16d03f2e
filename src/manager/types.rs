use crate::conf::name::TunnelName;
use crate::services::notify_bits;
use crate::updater::DownloadProgress;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, EnumIter, Display,
)]
pub enum TunnelState {
    #[default]
    Unknown,
    Starting,
    Started,
    Stopping,
    Stopped,
    Deleting,
}

impl TunnelState {
    /// Decodes a status-change notification. When several bits fire at
    /// once the first match of delete-pending, stopped, stop-pending,
    /// running, start-pending wins.
    pub fn from_notify_bits(bits: u32) -> TunnelState {
        if bits & notify_bits::DELETE_PENDING != 0 {
            TunnelState::Deleting
        } else if bits & notify_bits::STOPPED != 0 {
            TunnelState::Stopped
        } else if bits & notify_bits::STOP_PENDING != 0 {
            TunnelState::Stopping
        } else if bits & notify_bits::RUNNING != 0 {
            TunnelState::Started
        } else if bits & notify_bits::START_PENDING != 0 {
            TunnelState::Starting
        } else {
            TunnelState::Unknown
        }
    }

    /// The canonical lifecycle order. A worker can die at any point, so
    /// `Stopped` is reachable from every live state, and `Deleting` from
    /// every state but itself.
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        match (self, next) {
            (Deleting, _) => false,
            (_, Deleting) => true,
            (Unknown, Starting | Started | Stopping | Stopped) => true,
            (Starting, Started | Stopping | Stopped) => true,
            (Started, Stopping | Stopped) => true,
            (Stopping, Stopped) => true,
            (Stopped, Starting) => true,
            _ => false,
        }
    }
}

/// Aggregate state over all tracked tunnels.
pub fn global_state<I>(states: I) -> TunnelState
where
    I: IntoIterator<Item = TunnelState>,
{
    let mut any_live = false;
    for state in states {
        match state {
            TunnelState::Starting | TunnelState::Stopping => return state,
            TunnelState::Started | TunnelState::Unknown => any_live = true,
            TunnelState::Stopped | TunnelState::Deleting => {}
        }
    }
    if any_live {
        TunnelState::Started
    } else {
        TunnelState::Stopped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tunnel {
    pub name: TunnelName,
}

impl Tunnel {
    pub fn new(name: TunnelName) -> Self {
        Self { name }
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle a client registers to receive notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotifierId(pub u64);

/// Identity of one control connection, handed out when it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
pub enum UpdateState {
    #[default]
    Unknown,
    FoundUpdate,
    UpdatesDisabledUnofficialBuild,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    TunnelChange {
        name: TunnelName,
        state: TunnelState,
        global_state: TunnelState,
        error: Option<String>,
    },
    TunnelsChange,
    ManagerStopping,
    UpdateFound(UpdateState),
    UpdateProgress(DownloadProgress),
}
