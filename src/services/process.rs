use crate::conf::name::TunnelName;
use crate::constants::WORKER_READY_MARKER;
use crate::errors;
use crate::process_log::capture_child_output;
use crate::services::errors::WorkerExit;
use crate::services::object::{ServiceHandle, ServiceTable};
use crate::services::{
    ServiceControlError, ServiceManager, ServiceStatus, ServiceWatcher,
};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Workers get this long after a stop request before they are killed. It is
/// longer than the worker's own shutdown watchdog.
const FORCE_KILL_AFTER: Duration = Duration::from_secs(45);

/// Runs each tunnel worker as a child process of the manager.
pub struct ProcessServiceManager {
    table: ServiceTable,
    executable: PathBuf,
    log_directory: PathBuf,
    runtime_directory: PathBuf,
    manager_socket: PathBuf,
    engine_binary: Option<PathBuf>,
}

impl ProcessServiceManager {
    pub fn new(
        runtime: Handle,
        executable: PathBuf,
        log_directory: PathBuf,
        runtime_directory: PathBuf,
        manager_socket: PathBuf,
    ) -> Self {
        Self {
            table: ServiceTable::new(runtime),
            executable,
            log_directory,
            runtime_directory,
            manager_socket,
            engine_binary: None,
        }
    }

    /// Passed to every worker; without it workers use their default engine.
    pub fn with_engine_binary(mut self, engine_binary: Option<PathBuf>) -> Self {
        self.engine_binary = engine_binary;
        self
    }

    fn spawn_worker(&self, config_path: &Path) -> anyhow::Result<Child> {
        tracing::info!(
            "Spawning tunnel worker: {} tunnel --config {}",
            self.executable.display(),
            config_path.display()
        );

        let mut command = Command::new(&self.executable);
        command
            .arg("tunnel")
            .arg("--config")
            .arg(config_path)
            .arg("--runtime-dir")
            .arg(&self.runtime_directory)
            .arg("--log-dir")
            .arg(&self.log_directory);
        if let Some(ref engine) = self.engine_binary {
            command.arg("--engine").arg(engine);
        }
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        command.spawn().map_err(|e| {
            let error_msg = e.to_string();
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::anyhow!(errors::binary::not_found(
                    &self.executable.display().to_string()
                ))
            } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                anyhow::anyhow!(errors::binary::permission_denied(
                    &self.executable.display().to_string()
                ))
            } else {
                anyhow::anyhow!(errors::process::spawn_failed(&error_msg))
            }
        })
    }
}

impl ServiceManager for ProcessServiceManager {
    fn install_tunnel(
        &self,
        config_path: &Path,
        name: &TunnelName,
    ) -> Result<(), ServiceControlError> {
        let Some(handle) = self.table.create(name) else {
            tracing::info!("Service for tunnel '{}' is already installed", name);
            return Ok(());
        };

        let _guard = self.table.runtime().enter();
        let child = self.spawn_worker(config_path)?;
        let log_directory = self.log_directory.clone();
        self.table
            .runtime()
            .spawn(supervise_worker(handle, child, log_directory));
        Ok(())
    }

    fn uninstall_tunnel(&self, name: &TunnelName) -> Result<(), ServiceControlError> {
        match self.table.request_stop(name) {
            true => {
                tracing::info!("Requested stop of tunnel '{}'", name);
                Ok(())
            }
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
        match std::fs::remove_file(&self.manager_socket) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to remove manager socket {}",
                    self.manager_socket.display()
                )
            }),
        }
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!("Failed to signal worker {}: {}", pid, e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to terminate worker: {}", e);
    }
}

async fn supervise_worker(handle: ServiceHandle, mut child: Child, log_directory: PathBuf) {
    let name = handle.name().clone();
    let stop = handle.stop_token();
    let publisher = handle.publisher();

    let label = format!("tunnel-{}", name);
    match capture_child_output(
        &mut child,
        &log_directory,
        &label,
        CancellationToken::new(),
        move |line| {
            if line.trim() == WORKER_READY_MARKER {
                publisher.publish(ServiceStatus::Running);
            }
        },
    )
    .await
    {
        Ok((log_path, _task)) => {
            tracing::info!("Tunnel '{}' output is logged to {}", name, log_path.display())
        }
        Err(e) => tracing::warn!("Unable to capture output of tunnel '{}': {:#}", name, e),
    }

    let kill_deadline = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(kill_deadline);
    let mut stopping = false;
    let mut killed = false;

    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => WorkerExit::from_exit_code(status.code()),
                    Err(e) => {
                        tracing::error!("Failed to wait for tunnel '{}': {}", name, e);
                        WorkerExit::Terminated
                    }
                };
            }
            _ = stop.cancelled(), if !stopping => {
                stopping = true;
                handle.publish(ServiceStatus::StopPending);
                terminate_gracefully(&mut child);
                kill_deadline.as_mut().reset(Instant::now() + FORCE_KILL_AFTER);
            }
            _ = &mut kill_deadline, if stopping && !killed => {
                killed = true;
                tracing::warn!("Tunnel '{}' did not stop in time, killing it", name);
                let _ = child.start_kill();
            }
        }
    };

    match exit.error_message() {
        Some(message) => tracing::error!("Tunnel '{}' stopped: {}", name, message),
        None => tracing::info!("Tunnel '{}' stopped", name),
    }
    handle.publish(ServiceStatus::Stopped(exit));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(executable: PathBuf, runtime: &tokio::runtime::Runtime) -> ProcessServiceManager {
        let dir = std::env::temp_dir().join(format!(
            "tunnel_manager_process_test_{}",
            uuid::Uuid::new_v4()
        ));
        ProcessServiceManager::new(
            runtime.handle().clone(),
            executable,
            dir.join("logs"),
            dir.join("run"),
            dir.join("manager.sock"),
        )
    }

    #[test]
    fn test_uninstall_unknown_tunnel() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let manager = manager_with(PathBuf::from("/nonexistent"), &runtime);
        let name = TunnelName::new("ghost").unwrap();

        assert!(matches!(
            manager.uninstall_tunnel(&name),
            Err(ServiceControlError::DoesNotExist(_))
        ));
        assert!(manager.query_status(&name).is_none());
        assert!(manager.open_watcher(&name).is_err());
    }

    #[test]
    fn test_install_missing_executable_leaves_no_service() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let manager = manager_with(PathBuf::from("/nonexistent/tunnel_manager"), &runtime);
        let name = TunnelName::new("corp-vpn").unwrap();

        let result = manager.install_tunnel(Path::new("/tmp/corp-vpn.conf.yaml"), &name);
        assert!(result.is_err());
        assert!(manager.query_status(&name).is_none());
    }

    #[test]
    fn test_uninstall_manager_without_socket() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let manager = manager_with(PathBuf::from("/nonexistent"), &runtime);
        assert!(manager.uninstall_manager().is_ok());
    }
}
