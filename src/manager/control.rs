//! The manager's top-level loop: startup, serving, and the drain on exit.

use crate::conf::{ConfigStore, ManagerSettings};
use crate::errors;
use crate::ipc::server::serve;
use crate::ipc::transport::IpcListener;
use crate::manager::notifier::NotifierRegistry;
use crate::manager::service::{ManagerService, STOP_WAIT_TIMEOUT};
use crate::manager::sessions::{SESSION_POLL_INTERVAL, SessionSupervisor};
use crate::manager::types::Notification;
use crate::services::{ServiceError, ServiceFailure, ServiceManager, ServiceResultExt};
use crate::updater::{CheckSchedule, UpdateService, run_update_checker};
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ControlOptions {
    pub settings: ManagerSettings,
    pub services: Arc<dyn ServiceManager>,
    pub updates: Arc<dyn UpdateService>,
    pub supervisor: Option<Arc<SessionSupervisor>>,
    pub check_schedule: CheckSchedule,
}

impl ControlOptions {
    pub fn new(
        settings: ManagerSettings,
        services: Arc<dyn ServiceManager>,
        updates: Arc<dyn UpdateService>,
    ) -> Self {
        Self {
            settings,
            services,
            updates,
            supervisor: None,
            check_schedule: CheckSchedule::default(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: Arc<SessionSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }
}

fn spawn_store_watcher(store: &ConfigStore, registry: Arc<NotifierRegistry>, stop: CancellationToken) {
    let mut watcher = match store.watch() {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!("Tunnel list changes will not be announced: {:#}", e);
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = watcher.changed() => match changed {
                    Some(()) => {
                        registry.broadcast(&Notification::TunnelsChange);
                    }
                    None => break,
                },
            }
        }
    });
}

/// Runs the manager until a client quits it or `stop_signal` resolves.
/// Startup failures are fatal and carry the step that failed.
pub async fn run_control_loop<S>(options: ControlOptions, stop_signal: S) -> Result<(), ServiceFailure>
where
    S: Future<Output = ()>,
{
    let ControlOptions {
        settings,
        services,
        updates,
        supervisor,
        check_schedule,
    } = options;

    tokio::fs::create_dir_all(&settings.config_directory)
        .await
        .with_context(|| {
            errors::config::failed_to_create_dir(&settings.config_directory.display().to_string())
        })
        .service_err(ServiceError::LoadConfiguration)?;

    let service = Arc::new(ManagerService::new(
        ConfigStore::new(settings.config_directory.clone()),
        services.clone(),
        updates.clone(),
        settings.runtime_directory.clone(),
    ));
    service
        .track_existing_tunnels()
        .await
        .service_err(ServiceError::TrackTunnels)?;

    let listener = IpcListener::bind(&settings.socket_path)
        .await
        .service_err(ServiceError::UapiListen)?;
    let server_stop = CancellationToken::new();
    let server = tokio::spawn(serve(listener, service.clone(), server_stop.clone()));

    let background = CancellationToken::new();
    spawn_store_watcher(service.store(), service.registry().clone(), background.clone());

    if settings.update_checks {
        let registry = service.registry().clone();
        tokio::spawn(run_update_checker(
            updates.clone(),
            check_schedule,
            move |state| {
                registry.broadcast(&Notification::UpdateFound(state));
            },
            background.clone(),
        ));
    }

    if let Some(ref supervisor) = supervisor {
        if let Err(failure) = supervisor.start() {
            background.cancel();
            server_stop.cancel();
            let _ = server.await;
            return Err(failure);
        }
        tokio::spawn(
            supervisor
                .clone()
                .watch_sessions(SESSION_POLL_INTERVAL, background.clone()),
        );
    }

    tracing::info!("Manager running");
    let quit = service.shutdown_token();
    tokio::select! {
        _ = quit.cancelled() => tracing::info!("Manager quit by client request"),
        _ = stop_signal => tracing::info!("Manager received stop request"),
    }

    let delivered = service.registry().broadcast(&Notification::ManagerStopping);
    tracing::debug!("Told {} notifiers the manager is stopping", delivered);
    if let Some(ref supervisor) = supervisor {
        supervisor.drain().await;
    }

    if !service.quit_requested()
        && settings.stop_tunnels_on_quit
        && tokio::time::timeout(STOP_WAIT_TIMEOUT, service.stop_all_tunnels())
            .await
            .is_err()
    {
        tracing::warn!("Not every tunnel stopped before the manager exited");
    }

    background.cancel();
    server_stop.cancel();
    match server.await {
        Ok(Err(e)) => tracing::warn!("IPC server: {:#}", e),
        Err(e) => tracing::warn!("IPC server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    if service.quit_requested()
        && let Err(e) = services.uninstall_manager()
    {
        tracing::error!("Unable to uninstall manager: {:#}", e);
    }

    tracing::info!("Manager stopped");
    Ok(())
}
