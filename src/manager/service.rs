//! Request handling for the manager's control protocol.

use crate::conf::name::TunnelName;
use crate::conf::{ConfigStore, TunnelConfig};
use crate::errors;
use crate::ipc::protocol::{EventFrame, Request, Response};
use crate::ipc::runtime::query_runtime_config;
use crate::ipc::server::ControlHandler;
use crate::manager::notifier::NotifierRegistry;
use crate::manager::tracker::TunnelTracker;
use crate::manager::types::{ConnectionId, Notification, Tunnel, TunnelState};
use crate::services::names::pipe_path_in;
use crate::services::{ServiceControlError, ServiceManager, ServiceStatus};
use crate::updater::UpdateService;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long Start waits for a stopping tunnel, and Delete for a stop.
pub const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RUNTIME_CONFIG_TIMEOUT: Duration = Duration::from_secs(2);
const TRACK_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const TRACK_RETRIES: usize = 40;

pub struct ManagerService {
    store: ConfigStore,
    services: Arc<dyn ServiceManager>,
    tracker: Arc<TunnelTracker>,
    registry: Arc<NotifierRegistry>,
    updates: Arc<dyn UpdateService>,
    runtime_directory: PathBuf,
    quit: AtomicBool,
    shutdown: CancellationToken,
}

fn state_of(status: Option<ServiceStatus>) -> TunnelState {
    match status {
        Some(status) => TunnelState::from_notify_bits(status.notify_bits()),
        None => TunnelState::Stopped,
    }
}

impl ManagerService {
    pub fn new(
        store: ConfigStore,
        services: Arc<dyn ServiceManager>,
        updates: Arc<dyn UpdateService>,
        runtime_directory: PathBuf,
    ) -> Self {
        let registry = Arc::new(NotifierRegistry::new());
        let tracker = Arc::new(TunnelTracker::new(services.clone(), registry.clone()));
        Self {
            store,
            services,
            tracker,
            registry,
            updates,
            runtime_directory,
            quit: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<NotifierRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<TunnelTracker> {
        &self.tracker
    }

    pub fn updates(&self) -> &Arc<dyn UpdateService> {
        &self.updates
    }

    /// Fires once a client has asked the manager to quit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    fn current_state(&self, name: &TunnelName) -> TunnelState {
        state_of(self.services.query_status(name))
    }

    async fn ensure_exists(&self, name: &TunnelName) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.store.exists(name).await,
            errors::tunnel::not_found(name.as_str())
        );
        Ok(())
    }

    pub async fn stored_config(&self, name: &TunnelName) -> anyhow::Result<TunnelConfig> {
        self.store.load(name).await
    }

    /// The configuration the worker is actually running, with live peer
    /// statistics.
    pub async fn runtime_config(&self, name: &TunnelName) -> anyhow::Result<TunnelConfig> {
        anyhow::ensure!(
            self.current_state(name) == TunnelState::Started,
            errors::tunnel::not_running(name.as_str())
        );
        let pipe_path = pipe_path_in(&self.runtime_directory, name);
        tokio::time::timeout(RUNTIME_CONFIG_TIMEOUT, query_runtime_config(&pipe_path))
            .await
            .map_err(|_| anyhow::anyhow!(errors::tunnel::runtime_config_timeout(name.as_str())))?
            .with_context(|| errors::tunnel::runtime_config_failed(name.as_str()))
    }

    pub async fn state(&self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        match self.services.query_status(name) {
            Some(status) => Ok(state_of(Some(status))),
            None => {
                self.ensure_exists(name).await?;
                Ok(TunnelState::Stopped)
            }
        }
    }

    pub fn global_state(&self) -> TunnelState {
        self.tracker.global_state()
    }

    /// Starting a tunnel that is already starting or running returns its
    /// current state.
    pub async fn start(&self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        self.ensure_exists(name).await?;

        match self.current_state(name) {
            state @ (TunnelState::Starting | TunnelState::Started) => {
                tracing::debug!("Tunnel '{}' is already {}", name, state);
                return Ok(state);
            }
            TunnelState::Stopping => {
                let state = self.wait_for_stop(name, Some(STOP_WAIT_TIMEOUT)).await;
                anyhow::ensure!(
                    state == TunnelState::Stopped,
                    errors::tunnel::transitional_state(name.as_str())
                );
            }
            _ => {}
        }

        // Load first so a broken file fails here rather than in the worker.
        self.store.load(name).await?;
        let path = self.store.path_of(name);
        self.services
            .install_tunnel(&path, name)
            .map_err(anyhow::Error::from)
            .with_context(|| errors::tunnel::failed_to_start(name.as_str()))?;
        tracing::info!("Starting tunnel '{}'", name);

        self.track_new_service(name).await;
        Ok(TunnelState::Starting)
    }

    /// A tracker for the previous service object of this tunnel may still be
    /// winding down; give it a moment before tracking the new one.
    async fn track_new_service(&self, name: &TunnelName) {
        for _ in 0..TRACK_RETRIES {
            match self.tracker.track(name) {
                Ok(true) => return,
                Ok(false) => tokio::time::sleep(TRACK_RETRY_INTERVAL).await,
                Err(e) => {
                    tracing::warn!("{:#}", e);
                    return;
                }
            }
        }
        tracing::warn!("{}", errors::tunnel::failed_to_track(name.as_str()));
    }

    /// Stopping a tunnel without a running service returns Stopped.
    pub async fn stop(&self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        match self.services.query_status(name) {
            None => {
                self.ensure_exists(name).await?;
                return Ok(TunnelState::Stopped);
            }
            Some(ServiceStatus::Stopped(_)) => return Ok(TunnelState::Stopped),
            Some(ServiceStatus::StopPending | ServiceStatus::DeletePending) => {
                return Ok(TunnelState::Stopping);
            }
            Some(_) => {}
        }

        match self.services.uninstall_tunnel(name) {
            Ok(()) => {
                tracing::info!("Stopping tunnel '{}'", name);
                Ok(TunnelState::Stopping)
            }
            Err(ServiceControlError::DoesNotExist(_)) => Ok(TunnelState::Stopped),
            Err(ServiceControlError::Other(e)) => {
                Err(e).with_context(|| errors::tunnel::failed_to_stop(name.as_str()))
            }
        }
    }

    /// Waits until the tunnel is Stopped or Deleting, or until `timeout`
    /// runs out or the manager shuts down. Returns the last state seen.
    pub async fn wait_for_stop(&self, name: &TunnelName, timeout: Option<Duration>) -> TunnelState {
        let mut changes = self.tracker.subscribe();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let state = self.current_state(name);
            if matches!(state, TunnelState::Stopped | TunnelState::Deleting) {
                return state;
            }

            let mut poll = STOP_POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return state;
                }
                poll = poll.min(deadline - now);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return self.current_state(name),
                _ = tokio::time::timeout(poll, changes.recv()) => {}
            }
        }
    }

    /// Stops the tunnel and removes its configuration. Refuses to delete a
    /// tunnel that did not stop.
    pub async fn delete(&self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        self.ensure_exists(name).await?;
        self.stop(name).await?;

        let state = self.wait_for_stop(name, Some(STOP_WAIT_TIMEOUT)).await;
        anyhow::ensure!(
            state == TunnelState::Stopped,
            errors::tunnel::STOP_BEFORE_DELETE
        );

        self.store.delete(name).await?;
        tracing::info!("Deleted tunnel '{}'", name);
        Ok(TunnelState::Deleting)
    }

    /// Saves `config`, replacing any stored configuration of the same name
    /// unless that tunnel is running.
    pub async fn create(&self, config: TunnelConfig) -> anyhow::Result<Tunnel> {
        config
            .validate()
            .with_context(|| errors::config::validation_failed(config.name.as_str()))?;

        let state = self.current_state(&config.name);
        anyhow::ensure!(
            state == TunnelState::Stopped,
            errors::tunnel::running_overwrite(config.name.as_str())
        );

        self.store.save(&config).await?;
        Ok(Tunnel::new(config.name))
    }

    pub async fn tunnels(&self) -> anyhow::Result<Vec<Tunnel>> {
        Ok(self
            .store
            .list_config_names()
            .await?
            .into_iter()
            .map(Tunnel::new)
            .collect())
    }

    /// The first call wins. Later calls report `true` and change nothing.
    pub async fn quit(
        &self,
        connection: ConnectionId,
        stop_tunnels_on_quit: bool,
    ) -> anyhow::Result<bool> {
        if self
            .quit
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(true);
        }

        tracing::info!("Quit requested by {}", connection);
        // The caller is going away; do not deliver to it during shutdown.
        self.registry.unregister_all(connection);

        if stop_tunnels_on_quit {
            self.stop_all_tunnels().await;
        }
        self.shutdown.cancel();
        Ok(false)
    }

    /// Asks every stored tunnel to stop. Individual failures are logged.
    pub async fn stop_all_tunnels(&self) {
        let names = match self.store.list_config_names().await {
            Ok(names) => names,
            Err(e) => {
                tracing::error!("Unable to list tunnels to stop: {:#}", e);
                return;
            }
        };
        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::warn!("{:#}", e);
            }
        }
    }

    /// Starts a tracker for every stored tunnel whose service is live.
    pub async fn track_existing_tunnels(&self) -> anyhow::Result<()> {
        let names = self
            .store
            .list_config_names()
            .await
            .context(errors::tunnel::TRACK_EXISTING_FAILED)?;
        for name in names {
            if self.services.query_status(&name).is_none() {
                continue;
            }
            match self.tracker.track(&name) {
                Ok(_) => {}
                Err(e) => match e.downcast_ref::<ServiceControlError>() {
                    // Stopped between the query and the watch.
                    Some(ServiceControlError::DoesNotExist(_)) => {}
                    _ => return Err(e.context(errors::tunnel::TRACK_EXISTING_FAILED)),
                },
            }
        }
        Ok(())
    }

    /// Runs the update pipeline and relays its progress to every notifier.
    pub fn update(&self) {
        let mut progress = self.updates.start_update(self.shutdown.child_token());
        let registry = self.registry.clone();
        tokio::spawn(async move {
            while let Some(item) = progress.recv().await {
                let terminal = item.is_terminal();
                registry.broadcast(&Notification::UpdateProgress(item));
                if terminal {
                    break;
                }
            }
        });
    }
}

impl ControlHandler for ManagerService {
    fn connection_opened(&self, connection: ConnectionId) {
        self.registry.open_connection(connection);
    }

    async fn handle(&self, connection: ConnectionId, request: Request) -> Response {
        match request {
            Request::StoredConfig { name } => {
                Response::from_result(self.stored_config(&name).await, Response::Config)
            }
            Request::RuntimeConfig { name } => {
                Response::from_result(self.runtime_config(&name).await, Response::Config)
            }
            Request::Start { name } => {
                Response::from_result(self.start(&name).await, Response::State)
            }
            Request::Stop { name } => Response::from_result(self.stop(&name).await, Response::State),
            Request::Delete { name } => {
                Response::from_result(self.delete(&name).await, Response::State)
            }
            Request::State { name } => {
                Response::from_result(self.state(&name).await, Response::State)
            }
            Request::WaitForStop { name } => {
                let result = match self.ensure_exists(&name).await {
                    Ok(()) => Ok(self.wait_for_stop(&name, None).await),
                    Err(e) => Err(e),
                };
                Response::from_result(result, Response::State)
            }
            Request::Create { config } => {
                Response::from_result(self.create(config).await, Response::Tunnel)
            }
            Request::Tunnels => Response::from_result(self.tunnels().await, Response::Tunnels),
            Request::GlobalState => Response::State(self.global_state()),
            Request::Quit {
                stop_tunnels_on_quit,
            } => Response::from_result(
                self.quit(connection, stop_tunnels_on_quit).await,
                |already_quit| Response::Quit { already_quit },
            ),
            Request::RegisterAsNotificationThread { notifier } => {
                if self.registry.register(connection, notifier) {
                    Response::Done
                } else {
                    Response::Error(errors::ipc::unknown_connection(&connection.to_string()))
                }
            }
            Request::UnregisterAsNotificationThread { notifier } => {
                self.registry.unregister(connection, notifier);
                Response::Done
            }
            Request::UpdateState => Response::UpdateState(self.updates.update_state()),
            Request::Update => {
                self.update();
                Response::Done
            }
        }
    }

    fn attach_events(&self, connection: ConnectionId) -> Option<mpsc::Receiver<EventFrame>> {
        self.registry.attach_sink(connection)
    }

    fn connection_closed(&self, connection: ConnectionId) {
        self.registry.close_connection(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::config::tests::sample_config;
    use crate::manager::types::{NotifierId, UpdateState};
    use crate::services::MockServiceManager;
    use crate::services::errors::ServiceError;
    use crate::updater::DownloadProgress;
    use crate::updater::checker::tests::ScriptedUpdates;

    struct Fixture {
        service: ManagerService,
        services: Arc<MockServiceManager>,
        directory: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.directory);
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedUpdates::new(true, Vec::new()))
    }

    fn fixture_with(updates: ScriptedUpdates) -> Fixture {
        let directory =
            std::env::temp_dir().join(format!("tunnel_manager_test_{}", uuid::Uuid::new_v4()));
        let services = Arc::new(MockServiceManager::new(tokio::runtime::Handle::current()));
        let service = ManagerService::new(
            ConfigStore::new(directory.join("tunnels")),
            services.clone(),
            Arc::new(updates),
            directory.join("run"),
        );
        Fixture {
            service,
            services,
            directory,
        }
    }

    fn name(name: &str) -> TunnelName {
        TunnelName::new(name).unwrap()
    }

    async fn wait_until_started(service: &ManagerService, tunnel: &TunnelName) {
        for _ in 0..200 {
            if service.state(tunnel).await.unwrap() == TunnelState::Started {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel '{}' never started", tunnel);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lifecycle_of_one_tunnel() {
        let f = fixture();
        let tunnel = name("corp-vpn");

        let created = f.service.create(sample_config("corp-vpn")).await.unwrap();
        assert_eq!(created.name, tunnel);
        assert_eq!(f.service.state(&tunnel).await.unwrap(), TunnelState::Stopped);

        assert_eq!(f.service.start(&tunnel).await.unwrap(), TunnelState::Starting);
        wait_until_started(&f.service, &tunnel).await;
        assert!(f.service.tracker().is_tracked(&tunnel));

        assert_eq!(f.service.stop(&tunnel).await.unwrap(), TunnelState::Stopping);
        assert_eq!(
            f.service.wait_for_stop(&tunnel, Some(Duration::from_secs(5))).await,
            TunnelState::Stopped
        );
        assert_eq!(f.service.state(&tunnel).await.unwrap(), TunnelState::Stopped);

        assert_eq!(f.service.delete(&tunnel).await.unwrap(), TunnelState::Deleting);
        assert!(f.service.tunnels().await.unwrap().is_empty());
        assert!(f.service.state(&tunnel).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_and_stop_are_idempotent() {
        let f = fixture();
        let tunnel = name("office");
        f.service.create(sample_config("office")).await.unwrap();

        assert_eq!(f.service.stop(&tunnel).await.unwrap(), TunnelState::Stopped);

        f.service.start(&tunnel).await.unwrap();
        let again = f.service.start(&tunnel).await.unwrap();
        assert!(matches!(again, TunnelState::Starting | TunnelState::Started));
        wait_until_started(&f.service, &tunnel).await;
        assert_eq!(f.service.start(&tunnel).await.unwrap(), TunnelState::Started);
        assert_eq!(f.services.install_calls(), 1);

        f.service.stop(&tunnel).await.unwrap();
        f.service.wait_for_stop(&tunnel, Some(Duration::from_secs(5))).await;
        assert_eq!(f.service.stop(&tunnel).await.unwrap(), TunnelState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_after_stop_is_tracked_again() {
        let f = fixture();
        let tunnel = name("office");
        f.service.create(sample_config("office")).await.unwrap();

        for _ in 0..2 {
            f.service.start(&tunnel).await.unwrap();
            wait_until_started(&f.service, &tunnel).await;
            f.service.stop(&tunnel).await.unwrap();
            assert_eq!(
                f.service.wait_for_stop(&tunnel, Some(Duration::from_secs(5))).await,
                TunnelState::Stopped
            );
        }
        assert_eq!(f.services.install_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_tunnel_is_an_error() {
        let f = fixture();
        let tunnel = name("missing");
        for result in [
            f.service.start(&tunnel).await,
            f.service.stop(&tunnel).await,
            f.service.state(&tunnel).await,
            f.service.delete(&tunnel).await,
        ] {
            let message = result.unwrap_err().to_string();
            assert!(message.contains("not found"), "{}", message);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_refuses_running_tunnel() {
        let f = fixture();
        let tunnel = name("office");
        f.service.create(sample_config("office")).await.unwrap();
        f.service.start(&tunnel).await.unwrap();
        wait_until_started(&f.service, &tunnel).await;

        assert!(f.service.create(sample_config("office")).await.is_err());

        f.service.stop(&tunnel).await.unwrap();
        f.service.wait_for_stop(&tunnel, Some(Duration::from_secs(5))).await;
        assert!(f.service.create(sample_config("office")).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_worker_reports_error_to_notifiers() {
        let f = fixture();
        let tunnel = name("office");
        f.service.create(sample_config("office")).await.unwrap();

        let connection = ConnectionId::new();
        f.service.connection_opened(connection);
        let mut events = f.service.attach_events(connection).unwrap();
        assert_eq!(
            f.service
                .handle(
                    connection,
                    Request::RegisterAsNotificationThread {
                        notifier: NotifierId(1)
                    }
                )
                .await,
            Response::Done
        );

        f.services.fail_next_start(&tunnel, ServiceError::Firewall);
        f.service.start(&tunnel).await.unwrap();

        let error = loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let Notification::TunnelChange {
                state: TunnelState::Stopped,
                error,
                ..
            } = frame.notification
            {
                break error;
            }
        };
        assert!(error.unwrap().contains("firewall"));
        f.service.connection_closed(connection);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_quit_only_once() {
        let f = fixture();
        let tunnel = name("office");
        f.service.create(sample_config("office")).await.unwrap();
        f.service.start(&tunnel).await.unwrap();
        wait_until_started(&f.service, &tunnel).await;

        let connection = ConnectionId::new();
        f.service.connection_opened(connection);
        f.service.registry().register(connection, NotifierId(7));

        assert_eq!(
            f.service
                .handle(connection, Request::Quit { stop_tunnels_on_quit: true })
                .await,
            Response::Quit {
                already_quit: false
            }
        );
        assert!(f.service.shutdown_token().is_cancelled());
        assert_eq!(f.service.registry().notifier_count(), 0);
        let uninstalls = f.services.uninstall_calls();
        assert_eq!(uninstalls, 1);

        assert_eq!(
            f.service
                .handle(connection, Request::Quit { stop_tunnels_on_quit: true })
                .await,
            Response::Quit { already_quit: true }
        );
        assert_eq!(f.services.uninstall_calls(), uninstalls);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_requires_open_connection() {
        let f = fixture();
        let response = f
            .service
            .handle(
                ConnectionId::new(),
                Request::RegisterAsNotificationThread {
                    notifier: NotifierId(1),
                },
            )
            .await;
        assert!(matches!(response, Response::Error(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_progress_is_broadcast() {
        let updates = ScriptedUpdates::new(true, Vec::new());
        updates
            .progress
            .lock()
            .unwrap()
            .extend([DownloadProgress::activity("Initializing"), DownloadProgress::completed()]);
        let f = fixture_with(updates);

        let connection = ConnectionId::new();
        f.service.connection_opened(connection);
        let mut events = f.service.attach_events(connection).unwrap();
        f.service.registry().register(connection, NotifierId(1));

        assert_eq!(
            f.service.handle(connection, Request::UpdateState).await,
            Response::UpdateState(UpdateState::Unknown)
        );
        assert_eq!(f.service.handle(connection, Request::Update).await, Response::Done);

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let frame = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let Notification::UpdateProgress(progress) = frame.notification {
                seen.push(progress);
            }
        }
        assert_eq!(seen[0].activity, "Initializing");
        assert!(seen[1].complete);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runtime_config_requires_running_tunnel() {
        let f = fixture();
        f.service.create(sample_config("office")).await.unwrap();
        let message = f
            .service
            .runtime_config(&name("office"))
            .await
            .unwrap_err()
            .to_string();
        assert!(message.contains("not running"), "{}", message);
    }
}
