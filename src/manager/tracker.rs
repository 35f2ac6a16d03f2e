//! Follows the service object of each running tunnel and republishes its
//! status changes as notifications.

use crate::conf::name::TunnelName;
use crate::errors;
use crate::manager::notifier::NotifierRegistry;
use crate::manager::types::{Notification, TunnelState, global_state};
use crate::services::{ServiceControlError, ServiceManager, ServiceWatcher, WaitOutcome};
use anyhow::Context;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub name: TunnelName,
    pub state: TunnelState,
    pub error: Option<String>,
}

pub struct TunnelTracker {
    services: Arc<dyn ServiceManager>,
    registry: Arc<NotifierRegistry>,
    tracked: Mutex<HashMap<TunnelName, TunnelState>>,
    changes: broadcast::Sender<StateChange>,
}

impl TunnelTracker {
    pub fn new(services: Arc<dyn ServiceManager>, registry: Arc<NotifierRegistry>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            services,
            registry,
            tracked: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TunnelName, TunnelState>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every state change published by any tracker, in observation order
    /// per tunnel.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn is_tracked(&self, name: &TunnelName) -> bool {
        self.lock().contains_key(name)
    }

    pub fn global_state(&self) -> TunnelState {
        global_state(self.lock().values().copied())
    }

    /// Starts a tracker thread for `name` unless one is already running.
    /// Returns whether a new tracker was started.
    pub fn track(self: &Arc<Self>, name: &TunnelName) -> anyhow::Result<bool> {
        {
            let mut tracked = self.lock();
            if tracked.contains_key(name) {
                tracing::debug!("Tunnel '{}' is already tracked", name);
                return Ok(false);
            }
            tracked.insert(name.clone(), TunnelState::Unknown);
        }

        let watcher = match self.services.open_watcher(name) {
            Ok(watcher) => watcher,
            Err(e) => {
                self.lock().remove(name);
                return Err(match e {
                    ServiceControlError::DoesNotExist(_) => anyhow::Error::new(e),
                    ServiceControlError::Other(e) => e,
                })
                .with_context(|| errors::tunnel::failed_to_track(name.as_str()));
            }
        };

        let tracker = self.clone();
        let thread_name = name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tracker-{}", name))
            .spawn(move || tracker.run(thread_name, watcher));

        if let Err(e) = spawned {
            self.lock().remove(name);
            return Err(e).with_context(|| errors::tunnel::failed_to_track(name.as_str()));
        }
        Ok(true)
    }

    fn run(self: Arc<Self>, name: TunnelName, mut watcher: Box<dyn ServiceWatcher>) {
        tracing::info!("Tracking tunnel '{}'", name);
        let mut last = TunnelState::Unknown;

        loop {
            let change = match watcher.wait() {
                WaitOutcome::Changed(change) => change,
                WaitOutcome::Lagging => continue,
                WaitOutcome::MarkedForDelete => {
                    if last != TunnelState::Stopped {
                        self.publish(&name, TunnelState::Stopped, None);
                    }
                    break;
                }
                WaitOutcome::Failed(reason) => {
                    let error = errors::tunnel::monitoring_failed(&reason);
                    tracing::error!("Tunnel '{}': {}", name, error);
                    self.publish(&name, TunnelState::Stopped, Some(error));
                    watcher.request_stop();
                    break;
                }
            };

            let state = TunnelState::from_notify_bits(change.notified);
            let error = match state {
                TunnelState::Stopped => change.exit.error_message(),
                _ => None,
            };
            if let Some(ref error) = error {
                tracing::error!("Tunnel '{}' stopped with error: {}", name, error);
            }

            if state != last {
                if !last.can_transition_to(state) {
                    tracing::warn!(
                        "Tunnel '{}' moved from {} to {} out of order",
                        name,
                        last,
                        state
                    );
                }
                self.publish(&name, state, error);
                last = state;
            }

            if state == TunnelState::Deleting {
                break;
            }
        }

        self.lock().remove(&name);
        tracing::info!("Stopped tracking tunnel '{}'", name);
    }

    fn publish(&self, name: &TunnelName, state: TunnelState, error: Option<String>) {
        let global = {
            let mut tracked = self.lock();
            tracked.insert(name.clone(), state);
            global_state(tracked.values().copied())
        };

        tracing::info!("Tunnel '{}' is now {}", name, state);
        self.registry.broadcast(&Notification::TunnelChange {
            name: name.clone(),
            state,
            global_state: global,
            error: error.clone(),
        });
        let _ = self.changes.send(StateChange {
            name: name.clone(),
            state,
            error,
        });
    }
}
