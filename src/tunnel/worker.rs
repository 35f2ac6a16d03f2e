use crate::conf::store::load_from_path;
use crate::conf::TunnelConfig;
use crate::elevate::{PrivilegeBroker, TokenPlatform};
use crate::firewall::{FilterEngine, Firewall, FirewallError};
use crate::ipc::runtime::{RuntimeConfigSource, serve_runtime_config};
use crate::ipc::transport::IpcListener;
use crate::services::names::pipe_path_in;
use crate::services::{ServiceError, ServiceFailure, ServiceResultExt};
use crate::tunnel::engine::{Adapter, TunnelEngine, with_peer_stats};
use crate::tunnel::scripts::{Hook, run_hook};
use anyhow::Context;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const SHUTDOWN_TIMEOUT_EXIT_CODE: i32 = 777;
/// Still needed after setup to load the adapter driver on Windows.
pub const RETAINED_PRIVILEGE: &str = "SeLoadDriverPrivilege";

/// Kills the process if a shutdown takes too long. Dropping it disarms it.
pub struct ShutdownWatchdog {
    _disarm: std::sync::mpsc::Sender<()>,
}

impl ShutdownWatchdog {
    pub fn arm(timeout: Duration) -> Self {
        Self::arm_with(timeout, move || {
            tracing::error!("Failed to shutdown after {} seconds", timeout.as_secs());
            std::process::exit(SHUTDOWN_TIMEOUT_EXIT_CODE);
        })
    }

    pub fn arm_with<F>(timeout: Duration, on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (disarm, disarmed) = std::sync::mpsc::channel::<()>();
        let spawned = std::thread::Builder::new()
            .name("shutdown-watchdog".to_string())
            .spawn(move || {
                if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) =
                    disarmed.recv_timeout(timeout)
                {
                    on_expiry();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Unable to start shutdown watchdog: {}", e);
        }
        Self { _disarm: disarm }
    }
}

/// Replaces every endpoint hostname with the first address it resolves to.
pub async fn resolve_endpoints(config: &mut TunnelConfig) -> anyhow::Result<()> {
    for peer in &mut config.peers {
        let Some(ref mut endpoint) = peer.endpoint else {
            continue;
        };
        if endpoint.host.parse::<IpAddr>().is_ok() {
            continue;
        }
        let address = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .with_context(|| format!("Unable to resolve {}", endpoint.host))?
            .next()
            .with_context(|| format!("{} has no addresses", endpoint.host))?;
        tracing::info!("Resolved {} to {}", endpoint.host, address.ip());
        endpoint.host = address.ip().to_string();
    }
    Ok(())
}

struct LiveConfig<E> {
    engine: Arc<E>,
    config: TunnelConfig,
}

impl<E: TunnelEngine> RuntimeConfigSource for LiveConfig<E> {
    async fn runtime_config(&self) -> anyhow::Result<TunnelConfig> {
        let stats = self.engine.peer_stats().await?;
        Ok(with_peer_stats(self.config.clone(), &stats))
    }
}

struct Session {
    adapter: Adapter,
    listener_stop: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

/// One tunnel: its adapter, its firewall session and its runtime endpoint.
pub struct TunnelWorker<E: TunnelEngine, F: FilterEngine, P: TokenPlatform> {
    engine: Arc<E>,
    firewall: Firewall<F>,
    broker: Arc<PrivilegeBroker<P>>,
    runtime_directory: PathBuf,
}

impl<E: TunnelEngine, F: FilterEngine, P: TokenPlatform> TunnelWorker<E, F, P> {
    pub fn new(
        engine: Arc<E>,
        firewall: Firewall<F>,
        broker: Arc<PrivilegeBroker<P>>,
        runtime_directory: PathBuf,
    ) -> Self {
        Self {
            engine,
            firewall,
            broker,
            runtime_directory,
        }
    }

    pub fn firewall(&self) -> &Firewall<F> {
        &self.firewall
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Brings the tunnel up, calls `on_ready`, and runs until `shutdown`
    /// fires. Every setup failure is reported with the step that failed.
    pub async fn run<R: FnOnce()>(
        &mut self,
        config_path: &Path,
        shutdown: CancellationToken,
        on_ready: R,
    ) -> Result<(), ServiceFailure> {
        let config = load_from_path(config_path)
            .await
            .service_err(ServiceError::LoadConfiguration)?;
        tracing::info!("Starting tunnel '{}'", config.name);

        let mut resolved = config.clone();
        resolve_endpoints(&mut resolved)
            .await
            .service_err(ServiceError::DnsLookup)?;

        let adapter = match self.engine.create_adapter(&config.name).await {
            Ok(adapter) => adapter,
            Err(e) => {
                self.engine.close().await;
                return Err(ServiceFailure::new(ServiceError::CreateAdapter, e));
            }
        };
        tracing::info!("Created adapter {}", adapter.interface_name);

        let mut session = Session {
            adapter,
            listener_stop: CancellationToken::new(),
            listener: None,
        };
        if let Err(failure) = self.bring_up(&config, &resolved, &mut session).await {
            tracing::error!("{}", failure);
            self.tear_down(&config, session, false).await;
            return Err(failure);
        }

        tracing::info!("Tunnel '{}' is up", config.name);
        on_ready();

        shutdown.cancelled().await;
        tracing::info!("Shutting down tunnel '{}'", config.name);
        let _watchdog = ShutdownWatchdog::arm(SHUTDOWN_TIMEOUT);
        self.tear_down(&config, session, true).await;
        Ok(())
    }

    async fn bring_up(
        &mut self,
        config: &TunnelConfig,
        resolved: &TunnelConfig,
        session: &mut Session,
    ) -> Result<(), ServiceFailure> {
        let interface_name = session.adapter.interface_name.clone();

        run_hook(Hook::PreUp, &config.interface, &interface_name)
            .await
            .service_err(ServiceError::RunScript)?;

        let pipe_path = pipe_path_in(&self.runtime_directory, &config.name);
        let listener = IpcListener::bind(&pipe_path)
            .await
            .service_err(ServiceError::UapiListen)?;
        let source = Arc::new(LiveConfig {
            engine: self.engine.clone(),
            config: config.clone(),
        });
        session.listener = Some(tokio::spawn(serve_runtime_config(
            listener,
            source,
            session.listener_stop.clone(),
        )));

        self.engine
            .set_device_config(resolved)
            .await
            .service_err(ServiceError::DeviceSetConfig)?;
        self.engine
            .bind_default_routes(resolved)
            .await
            .service_err(ServiceError::BindSocketsToDefaultRoutes)?;
        self.engine
            .configure_interface(config)
            .await
            .service_err(ServiceError::SetNetConfig)?;

        self.enable_firewall(config, &session.adapter)
            .service_err(ServiceError::Firewall)?;

        run_hook(Hook::PostUp, &config.interface, &interface_name)
            .await
            .service_err(ServiceError::RunScript)?;

        self.broker
            .drop_all_privileges(Some(RETAINED_PRIVILEGE))
            .service_err(ServiceError::DropPrivileges)?;
        Ok(())
    }

    fn enable_firewall(
        &mut self,
        config: &TunnelConfig,
        adapter: &Adapter,
    ) -> Result<(), FirewallError> {
        let restrict_all = config.routes_all_traffic();
        let restrict_dns = !config.interface.dns.is_empty();
        if restrict_all && !restrict_dns {
            tracing::warn!(
                "Tunnel '{}' routes all traffic but sets no DNS servers; DNS queries will not be restricted",
                config.name
            );
        }

        match self.firewall.enable(adapter.id, restrict_dns, restrict_all) {
            Err(FirewallError::Unsupported) if !restrict_dns && !restrict_all => {
                tracing::warn!(
                    "Firewall is not supported on this platform; tunnel '{}' runs unprotected",
                    config.name
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn tear_down(&mut self, config: &TunnelConfig, mut session: Session, run_scripts: bool) {
        let interface_name = session.adapter.interface_name.as_str();
        if run_scripts
            && let Err(e) = run_hook(Hook::PreDown, &config.interface, interface_name).await
        {
            tracing::error!("{:#}", e);
        }

        self.firewall.disable();
        session.listener_stop.cancel();
        if let Some(listener) = session.listener.take() {
            let _ = listener.await;
        }
        self.engine.close().await;

        if run_scripts
            && let Err(e) = run_hook(Hook::PostDown, &config.interface, interface_name).await
        {
            tracing::error!("{:#}", e);
        }
        tracing::info!("Tunnel '{}' is down", config.name);
    }
}
