use crate::manager::types::UpdateState;
use crate::updater::UpdateService;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckSchedule {
    pub initial_delay: Duration,
    pub first_failure_delay: Duration,
    pub failure_delay: Duration,
    pub no_update_delay: Duration,
}

impl Default for CheckSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            first_failure_delay: Duration::from_secs(4 * 60),
            failure_delay: Duration::from_secs(25 * 60),
            no_update_delay: Duration::from_secs(60 * 60),
        }
    }
}

/// Polls for updates until one is found or `cancel` fires. `on_state`
/// fires once: with `FoundUpdate`, or with `UpdatesDisabledUnofficialBuild`
/// if this build cannot update at all.
pub async fn run_update_checker<F>(
    service: Arc<dyn UpdateService>,
    schedule: CheckSchedule,
    on_state: F,
    cancel: CancellationToken,
) where
    F: Fn(UpdateState) + Send,
{
    if !service.is_official_build() {
        tracing::info!("Update checks disabled for unofficial build");
        service.set_update_state(UpdateState::UpdatesDisabledUnofficialBuild);
        on_state(UpdateState::UpdatesDisabledUnofficialBuild);
        return;
    }

    let mut delay = schedule.initial_delay;
    let mut failed_before = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = service.check_for_update() => result,
        };
        delay = match result {
            Ok(Some(found)) => {
                tracing::info!("An update is available: {}", found.name);
                service.set_update_state(UpdateState::FoundUpdate);
                on_state(UpdateState::FoundUpdate);
                return;
            }
            Ok(None) => {
                tracing::debug!("No update available");
                schedule.no_update_delay
            }
            Err(e) => {
                tracing::warn!("Update checker: {:#}", e);
                if failed_before {
                    schedule.failure_delay
                } else {
                    failed_before = true;
                    schedule.first_failure_delay
                }
            }
        };
    }
}
