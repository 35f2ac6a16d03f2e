use crate::conf::name::TunnelName;
use crate::services::errors::{ServiceError, WorkerExit};
use crate::services::object::ServiceTable;
use crate::services::{ServiceControlError, ServiceManager, ServiceStatus, ServiceWatcher};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;

/// Simulated service controller. Workers walk through the usual status
/// sequence after a short delay without spawning anything.
pub struct MockServiceManager {
    table: ServiceTable,
    transition_delay: Duration,
    failures: Mutex<HashMap<TunnelName, ServiceError>>,
    install_calls: AtomicUsize,
    uninstall_calls: AtomicUsize,
    manager_uninstalled: AtomicBool,
}

impl MockServiceManager {
    pub fn new(runtime: Handle) -> Self {
        Self::with_delay(runtime, Duration::from_millis(20))
    }

    pub fn with_delay(runtime: Handle, transition_delay: Duration) -> Self {
        tracing::info!("Using simulated service manager");
        Self {
            table: ServiceTable::new(runtime),
            transition_delay,
            failures: Mutex::new(HashMap::new()),
            install_calls: AtomicUsize::new(0),
            uninstall_calls: AtomicUsize::new(0),
            manager_uninstalled: AtomicBool::new(false),
        }
    }

    /// The next start of `name` fails during setup with `error`.
    pub fn fail_next_start(&self, name: &TunnelName, error: ServiceError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), error);
    }

    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    pub fn uninstall_calls(&self) -> usize {
        self.uninstall_calls.load(Ordering::SeqCst)
    }

    pub fn manager_uninstalled(&self) -> bool {
        self.manager_uninstalled.load(Ordering::SeqCst)
    }
}

impl ServiceManager for MockServiceManager {
    fn install_tunnel(
        &self,
        _config_path: &Path,
        name: &TunnelName,
    ) -> Result<(), ServiceControlError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        let Some(handle) = self.table.create(name) else {
            return Ok(());
        };

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        let delay = self.transition_delay;

        tracing::info!("Mock: starting tunnel '{}'", name);
        self.table.runtime().spawn(async move {
            let stop = handle.stop_token();
            tokio::time::sleep(delay).await;

            if let Some(error) = failure {
                handle.publish(ServiceStatus::Stopped(WorkerExit::ServiceSpecific(
                    error.code(),
                )));
                return;
            }

            handle.publish(ServiceStatus::Running);
            stop.cancelled().await;
            handle.publish(ServiceStatus::StopPending);
            tokio::time::sleep(delay).await;
            handle.publish(ServiceStatus::Stopped(WorkerExit::Clean));
        });
        Ok(())
    }

    fn uninstall_tunnel(&self, name: &TunnelName) -> Result<(), ServiceControlError> {
        self.uninstall_calls.fetch_add(1, Ordering::SeqCst);
        match self.table.request_stop(name) {
            true => Ok(()),
            false => Err(ServiceControlError::DoesNotExist(name.clone())),
        }
    }

    fn query_status(&self, name: &TunnelName) -> Option<ServiceStatus> {
        self.table.status(name)
    }

    fn open_watcher(
        &self,
        name: &TunnelName,
    ) -> Result<Box<dyn ServiceWatcher>, ServiceControlError> {
        self.table
            .watcher(name)
            .map(|w| Box::new(w) as Box<dyn ServiceWatcher>)
            .ok_or_else(|| ServiceControlError::DoesNotExist(name.clone()))
    }

    fn uninstall_manager(&self) -> anyhow::Result<()> {
        self.manager_uninstalled.store(true, Ordering::SeqCst);
        Ok(())
    }
}
