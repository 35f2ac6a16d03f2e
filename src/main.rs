// tunnel_manager
// Entry point for the manager service, tunnel workers and the CLI client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use tunnel_manager::conf::{ManagerSettings, TunnelName, load_settings};
use tunnel_manager::constants::{
    self, APP_NAME, CONFIG_FILE_SUFFIX, MOCK_ENV_VAR, WORKER_READY_MARKER,
};
use tunnel_manager::elevate::{PrivilegeBroker, native_broker};
use tunnel_manager::firewall::{MemoryEngine, native_firewall};
use tunnel_manager::ipc::ManagerClient;
use tunnel_manager::manager::sessions::{CommandUiLauncher, MockSessionSource};
use tunnel_manager::manager::{ControlOptions, NotifierId, SessionSupervisor, run_control_loop};
use tunnel_manager::services::{
    MockServiceManager, ProcessServiceManager, ServiceError, ServiceFailure, ServiceManager,
    ServiceResultExt,
};
use tunnel_manager::tunnel::{CommandEngine, MockEngine, TunnelWorker};
use tunnel_manager::updater::authenticode::native_code_signer;
use tunnel_manager::updater::fetch::ReqwestFetcher;
use tunnel_manager::updater::installer::native_installer;
use tunnel_manager::updater::{InstallIdentity, UpdateService, Updater, UpdaterConfig};

#[derive(Parser, Debug)]
#[command(name = "tunnel_manager", version)]
#[command(about = "Privileged tunnel manager, tunnel worker and control client")]
struct Args {
    #[arg(long, help = "Path to the manager settings file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Write JSON logs to stdout")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the manager service
    Manager,
    /// Run a single tunnel worker
    Tunnel {
        #[arg(long, help = "Tunnel configuration file")]
        config: PathBuf,

        #[arg(long = "runtime-dir")]
        runtime_dir: PathBuf,

        #[arg(long = "log-dir")]
        log_dir: PathBuf,

        #[arg(long, help = "Path to the tunnel engine binary")]
        engine: Option<PathBuf>,
    },
    /// Download, verify and install the newest update
    Update,
    /// Talk to a running manager
    Client {
        #[command(subcommand)]
        request: ClientRequest,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum ClientRequest {
    List,
    Start { name: String },
    Stop { name: String },
    State { name: String },
    Delete { name: String },
    Quit {
        #[arg(long, help = "Leave tunnels running")]
        keep_tunnels: bool,
    },
    Watch,
}

fn executable_directory() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
}

fn default_settings_path() -> PathBuf {
    match executable_directory() {
        Some(dir) => dir.join(format!("{}.yaml", APP_NAME)),
        None => PathBuf::from(format!("{}.yaml", APP_NAME)),
    }
}

fn default_engine_binary() -> PathBuf {
    let binary_name = if cfg!(windows) {
        "tunnel-engine.exe"
    } else {
        "tunnel-engine"
    };
    match executable_directory() {
        Some(dir) => dir.join(binary_name),
        None => PathBuf::from(binary_name),
    }
}

fn use_mock() -> bool {
    std::env::var(MOCK_ENV_VAR).is_ok()
}

fn setup_tracing(log_directory: &Path, file_name: &str, json_logs: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_directory).context("Failed to create log directory")?;

    let file_appender = tracing_appender::rolling::daily(log_directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).json())
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(guard)
}

fn init_logging(log_directory: &Path, file_name: &str, json_logs: bool) -> Result<WorkerGuard> {
    setup_tracing(log_directory, file_name, json_logs)
        .service_err(ServiceError::RingloggerOpen)
        .map_err(anyhow::Error::from)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Unable to listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Error listening for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Off Windows there is no token to switch to, so the update runs as the
/// current user.
fn install_identity(windows_identity: InstallIdentity) -> InstallIdentity {
    if cfg!(windows) {
        windows_identity
    } else {
        InstallIdentity::Current
    }
}

fn build_updater(
    settings: &ManagerSettings,
    identity: InstallIdentity,
) -> Result<Arc<dyn UpdateService>> {
    let update_directory = settings.runtime_directory.join("updates");
    let updater = Updater::new(
        UpdaterConfig::official(update_directory),
        Arc::new(ReqwestFetcher::new()?),
        Arc::new(native_code_signer()),
        Arc::new(native_installer()),
        Arc::new(native_broker()),
        identity,
        tokio::runtime::Handle::current(),
    );
    Ok(Arc::new(updater))
}

async fn load_manager_settings(path: Option<PathBuf>) -> Result<ManagerSettings> {
    let path = path.unwrap_or_else(default_settings_path);
    load_settings(&path)
        .await
        .service_err(ServiceError::LoadConfiguration)
        .map_err(anyhow::Error::from)
}

async fn run_manager(settings_path: Option<PathBuf>, json_logs: bool) -> Result<()> {
    let settings = load_manager_settings(settings_path).await?;
    let _guard = init_logging(&settings.log_directory, "manager.log", json_logs)?;
    tracing::info!("{} {} starting", APP_NAME, env!("CARGO_PKG_VERSION"));

    if let Some(days) = settings.log_retention_days
        && let Err(e) = tunnel_manager::conf::settings::cleanup_old_logs(&settings.log_directory, days).await
    {
        tracing::warn!("Failed to clean up old logs: {:#}", e);
    }

    let runtime = tokio::runtime::Handle::current();
    let services: Arc<dyn ServiceManager> = if use_mock() {
        tracing::info!("Running in MOCK mode - no real processes will be spawned");
        Arc::new(MockServiceManager::new(runtime))
    } else {
        let executable = std::env::current_exe().service_err(ServiceError::DetermineExecutablePath)?;
        Arc::new(
            ProcessServiceManager::new(
                runtime,
                executable,
                settings.log_directory.clone(),
                settings.runtime_directory.clone(),
                settings.socket_path.clone(),
            )
            .with_engine_binary(settings.engine_binary_path.clone()),
        )
    };

    let updates = build_updater(&settings, install_identity(InstallIdentity::System))?;
    let mut options = ControlOptions::new(settings.clone(), services, updates);
    if let Some(ref command) = settings.ui_command {
        match session_supervisor(command, &settings) {
            Some(supervisor) => options = options.with_supervisor(supervisor),
            None => tracing::warn!("UI supervision is not available on this platform"),
        }
    }

    run_control_loop(options, shutdown_signal()).await?;
    Ok(())
}

fn session_supervisor(command: &Path, settings: &ManagerSettings) -> Option<Arc<SessionSupervisor>> {
    if use_mock() {
        return Some(Arc::new(SessionSupervisor::new(
            Arc::new(MockSessionSource::new()),
            Arc::new(CommandUiLauncher::new(
                command.to_path_buf(),
                settings.socket_path.clone(),
            )),
            settings.log_directory.clone(),
        )));
    }

    #[cfg(windows)]
    {
        use tunnel_manager::manager::wts::{WtsSessionSource, WtsUiLauncher};
        Some(Arc::new(SessionSupervisor::new(
            Arc::new(WtsSessionSource),
            Arc::new(WtsUiLauncher::new(
                command.to_path_buf(),
                settings.socket_path.clone(),
            )),
            settings.log_directory.clone(),
        )))
    }
    #[cfg(not(windows))]
    {
        None
    }
}

fn announce_ready() {
    println!("{}", WORKER_READY_MARKER);
}

async fn run_tunnel(
    config: PathBuf,
    runtime_dir: PathBuf,
    log_dir: PathBuf,
    engine: Option<PathBuf>,
    json_logs: bool,
) -> Result<()> {
    let label = config
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.strip_suffix(CONFIG_FILE_SUFFIX).unwrap_or(n))
        .unwrap_or("unknown")
        .to_string();
    let _guard = init_logging(&log_dir, &format!("tunnel-{}.log", label), json_logs)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    let broker = Arc::new(native_broker());
    if use_mock() {
        tracing::info!("Running in MOCK mode - no adapter will be created");
        let mut worker = TunnelWorker::new(
            Arc::new(MockEngine::default()),
            tunnel_manager::firewall::Firewall::new(MemoryEngine::default()),
            Arc::new(PrivilegeBroker::new(
                tunnel_manager::elevate::mock::MockPlatform::already_system(),
            )),
            runtime_dir,
        );
        worker.run(&config, shutdown, announce_ready).await?;
        return Ok(());
    }

    let engine_binary = engine.unwrap_or_else(default_engine_binary);
    let mut worker = TunnelWorker::new(
        Arc::new(CommandEngine::new(engine_binary, runtime_dir.clone(), log_dir)),
        native_firewall(),
        broker,
        runtime_dir,
    );
    worker.run(&config, shutdown, announce_ready).await?;
    Ok(())
}

async fn run_update(settings_path: Option<PathBuf>, json_logs: bool) -> Result<()> {
    let settings = load_manager_settings(settings_path).await?;
    let _guard = init_logging(&settings.log_directory, "update.log", json_logs)?;

    let updates = build_updater(
        &settings,
        install_identity(InstallIdentity::Service(
            constants::MANAGER_SERVICE_NAME.to_string(),
        )),
    )?;
    let mut progress = updates.start_update(CancellationToken::new());
    while let Some(item) = progress.recv().await {
        if let Some(ref error) = item.error {
            anyhow::bail!("Update failed: {}", error);
        }
        if item.complete {
            println!("Update complete");
            break;
        }
        if item.bytes_total > 0 {
            println!(
                "{}: {}/{} bytes",
                item.activity, item.bytes_downloaded, item.bytes_total
            );
        } else {
            println!("{}", item.activity);
        }
    }
    Ok(())
}

async fn run_client(settings_path: Option<PathBuf>, request: ClientRequest) -> Result<()> {
    let path = settings_path.unwrap_or_else(default_settings_path);
    let settings = match tokio::fs::try_exists(&path).await {
        Ok(true) => load_settings(&path).await?,
        _ => ManagerSettings::default(),
    };
    let mut client = ManagerClient::connect(&settings.socket_path).await?;

    let name = |name: &str| -> Result<TunnelName> { Ok(TunnelName::new(name)?) };
    match request {
        ClientRequest::List => {
            for tunnel in client.tunnels().await? {
                let state = client.state(&tunnel.name).await?;
                println!("{}\t{}", tunnel.name, state);
            }
        }
        ClientRequest::Start { name: tunnel } => {
            println!("{}", client.start(&name(&tunnel)?).await?);
        }
        ClientRequest::Stop { name: tunnel } => {
            println!("{}", client.stop(&name(&tunnel)?).await?);
        }
        ClientRequest::State { name: tunnel } => {
            println!("{}", client.state(&name(&tunnel)?).await?);
        }
        ClientRequest::Delete { name: tunnel } => {
            println!("{}", client.delete(&name(&tunnel)?).await?);
        }
        ClientRequest::Quit { keep_tunnels } => {
            if client.quit(!keep_tunnels).await? {
                println!("Manager was already quitting");
            }
        }
        ClientRequest::Watch => {
            let notifier = NotifierId(u64::from(std::process::id()));
            client.register_notifier(notifier).await?;
            let mut events = client.events().await?;
            while let Some(frame) = events.next().await? {
                println!("{}", serde_json::to_string(&frame.notification)?);
            }
        }
    }
    Ok(())
}

fn exit_code_of(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<ServiceFailure>() {
        Some(failure) => failure.exit_code() as i32,
        None => 1,
    }
}

fn main() {
    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match args.command {
            Command::Manager => run_manager(args.config, args.json_logs).await,
            Command::Tunnel {
                config,
                runtime_dir,
                log_dir,
                engine,
            } => run_tunnel(config, runtime_dir, log_dir, engine, args.json_logs).await,
            Command::Update => run_update(args.config, args.json_logs).await,
            Command::Client { request } => run_client(args.config, request).await,
        }
    });

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        let code = exit_code_of(&e);
        drop(runtime);
        std::process::exit(code);
    }
}
