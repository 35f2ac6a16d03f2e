use crate::conf::name::TunnelName;
use crate::services::{ServiceStatus, ServiceWatcher, StatusChange, WaitOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct ServiceEntry {
    generation: u64,
    status: watch::Sender<ServiceStatus>,
    stop: CancellationToken,
}

/// In-process table of service objects shared by the process-backed and
/// simulated service managers.
#[derive(Clone)]
pub(crate) struct ServiceTable {
    services: Arc<Mutex<HashMap<TunnelName, ServiceEntry>>>,
    next_generation: Arc<AtomicU64>,
    runtime: Handle,
}

impl ServiceTable {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            services: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
            runtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TunnelName, ServiceEntry>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Creates a fresh service object in `StartPending`. Returns `None` while
    /// a previous object for the same tunnel has not yet stopped.
    pub(crate) fn create(&self, name: &TunnelName) -> Option<ServiceHandle> {
        let mut services = self.lock();
        if let Some(existing) = services.get(name)
            && !matches!(*existing.status.borrow(), ServiceStatus::Stopped(_))
        {
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (status, _) = watch::channel(ServiceStatus::StartPending);
        let stop = CancellationToken::new();
        services.insert(
            name.clone(),
            ServiceEntry {
                generation,
                status,
                stop: stop.clone(),
            },
        );

        Some(ServiceHandle {
            publisher: StatusPublisher {
                table: self.clone(),
                name: name.clone(),
                generation,
            },
            stop,
        })
    }

    pub(crate) fn status(&self, name: &TunnelName) -> Option<ServiceStatus> {
        self.lock().get(name).map(|entry| *entry.status.borrow())
    }

    pub(crate) fn request_stop(&self, name: &TunnelName) -> bool {
        match self.lock().get(name) {
            Some(entry) => {
                entry.stop.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn watcher(&self, name: &TunnelName) -> Option<ObjectWatcher> {
        self.lock().get(name).map(|entry| ObjectWatcher {
            rx: entry.status.subscribe(),
            stop: entry.stop.clone(),
            runtime: self.runtime.clone(),
            primed: false,
        })
    }

    fn publish(&self, name: &TunnelName, generation: u64, status: ServiceStatus) {
        let services = self.lock();
        if let Some(entry) = services.get(name)
            && entry.generation == generation
        {
            entry.status.send_replace(status);
        }
    }

    fn remove(&self, name: &TunnelName, generation: u64) {
        let mut services = self.lock();
        if services
            .get(name)
            .is_some_and(|entry| entry.generation == generation)
        {
            services.remove(name);
        }
    }
}

#[derive(Clone)]
pub(crate) struct StatusPublisher {
    table: ServiceTable,
    name: TunnelName,
    generation: u64,
}

impl StatusPublisher {
    pub(crate) fn publish(&self, status: ServiceStatus) {
        tracing::debug!("Service for tunnel '{}' is now {:?}", self.name, status);
        self.table.publish(&self.name, self.generation, status);
    }
}

/// Owned by the task driving one service object. Dropping it deletes the
/// object, which wakes every watcher with `MarkedForDelete`.
pub(crate) struct ServiceHandle {
    publisher: StatusPublisher,
    stop: CancellationToken,
}

impl ServiceHandle {
    pub(crate) fn name(&self) -> &TunnelName {
        &self.publisher.name
    }

    pub(crate) fn publisher(&self) -> StatusPublisher {
        self.publisher.clone()
    }

    pub(crate) fn publish(&self, status: ServiceStatus) {
        self.publisher.publish(status);
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.publisher
            .table
            .remove(&self.publisher.name, self.publisher.generation);
    }
}

pub(crate) struct ObjectWatcher {
    rx: watch::Receiver<ServiceStatus>,
    stop: CancellationToken,
    runtime: Handle,
    primed: bool,
}

impl ServiceWatcher for ObjectWatcher {
    fn wait(&mut self) -> WaitOutcome {
        // The first wait reports the status current at subscription time.
        if !self.primed {
            self.primed = true;
            let status = *self.rx.borrow_and_update();
            return WaitOutcome::Changed(StatusChange::from(status));
        }

        match self.runtime.block_on(self.rx.changed()) {
            Ok(()) => {
                let status = *self.rx.borrow_and_update();
                WaitOutcome::Changed(StatusChange::from(status))
            }
            Err(_) => WaitOutcome::MarkedForDelete,
        }
    }

    fn request_stop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::errors::WorkerExit;
    use crate::services::notify_bits;

    #[test]
    fn test_watcher_sees_transitions_then_delete() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let table = ServiceTable::new(runtime.handle().clone());
        let name = TunnelName::new("corp-vpn").unwrap();

        let handle = table.create(&name).unwrap();
        let mut watcher = table.watcher(&name).unwrap();

        match watcher.wait() {
            WaitOutcome::Changed(change) => assert_eq!(change.notified, notify_bits::START_PENDING),
            other => panic!("unexpected {:?}", other),
        }

        handle.publish(ServiceStatus::Running);
        match watcher.wait() {
            WaitOutcome::Changed(change) => assert_eq!(change.notified, notify_bits::RUNNING),
            other => panic!("unexpected {:?}", other),
        }

        handle.publish(ServiceStatus::Stopped(WorkerExit::ServiceSpecific(6)));
        drop(handle);

        match watcher.wait() {
            WaitOutcome::Changed(change) => {
                assert_eq!(change.notified, notify_bits::STOPPED);
                assert_eq!(change.exit, WorkerExit::ServiceSpecific(6));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(watcher.wait(), WaitOutcome::MarkedForDelete);
        assert!(table.status(&name).is_none());
    }

    #[test]
    fn test_create_refuses_live_service() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let table = ServiceTable::new(runtime.handle().clone());
        let name = TunnelName::new("corp-vpn").unwrap();

        let first = table.create(&name).unwrap();
        assert!(table.create(&name).is_none());

        first.publish(ServiceStatus::Stopped(WorkerExit::Clean));
        let second = table.create(&name).unwrap();

        // The stale handle must not remove its replacement.
        drop(first);
        assert_eq!(table.status(&name), Some(ServiceStatus::StartPending));
        drop(second);
        assert!(table.status(&name).is_none());
    }

    #[test]
    fn test_request_stop_cancels_token() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let table = ServiceTable::new(runtime.handle().clone());
        let name = TunnelName::new("corp-vpn").unwrap();

        let handle = table.create(&name).unwrap();
        assert!(table.request_stop(&name));
        assert!(handle.stop_token().is_cancelled());

        let ghost = TunnelName::new("ghost").unwrap();
        assert!(!table.request_stop(&ghost));
    }
}
