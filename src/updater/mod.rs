//! Signed self-update: manifest check, download, verification and install.

pub mod authenticode;
pub mod checker;
pub mod fetch;
pub mod installer;
pub mod manifest;
pub mod pipeline;
pub mod version;

use crate::manager::types::UpdateState;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use checker::{CheckSchedule, run_update_checker};
pub use pipeline::{InstallIdentity, Updater, UpdaterConfig};

/// One step of a running update. The last item of every stream has either
/// `error` set or `complete` true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub activity: String,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub complete: bool,
}

impl DownloadProgress {
    pub fn activity(activity: &str) -> Self {
        Self {
            activity: activity.to_string(),
            ..Default::default()
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            complete: true,
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.complete || self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFound {
    pub name: String,
    pub hash: [u8; 32],
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("An update is already in progress")]
    AlreadyInProgress,
    #[error("No update was found when re-checking for updates")]
    NoUpdateFound,
    #[error("The downloaded update has the wrong hash")]
    WrongHash,
    #[error("The downloaded update is larger than {0} bytes")]
    TooLarge(u64),
    #[error("The update download ended after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("The downloaded update does not have an authentic code signature")]
    NotAuthentic,
    #[error("Invalid update file name: {0}")]
    InvalidName(String),
    #[error("Update cancelled")]
    Cancelled,
}

/// What the manager needs from the updater.
pub trait UpdateService: Send + Sync + 'static {
    fn is_official_build(&self) -> bool;

    fn update_state(&self) -> UpdateState;

    fn set_update_state(&self, state: UpdateState);

    fn check_for_update(&self) -> BoxFuture<'_, anyhow::Result<Option<UpdateFound>>>;

    /// Starts the full pipeline in the background. Progress, including a
    /// refusal because another update is running, arrives on the channel.
    fn start_update(&self, cancel: CancellationToken) -> mpsc::Receiver<DownloadProgress>;
}
