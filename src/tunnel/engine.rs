//! The external tunnel engine a worker drives: it owns the virtual adapter
//! and the encrypted transport.

use crate::conf::name::TunnelName;
use crate::conf::{Key, PeerStats, TunnelConfig};
use crate::firewall::AdapterId;
use crate::ipc::transport;
use crate::process_log::capture_child_output;
use crate::tunnel::uapi;
use anyhow::{Context, bail};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adapter {
    pub id: AdapterId,
    pub interface_name: String,
}

pub trait TunnelEngine: Send + Sync + 'static {
    fn create_adapter(
        &self,
        name: &TunnelName,
    ) -> impl Future<Output = anyhow::Result<Adapter>> + Send;

    fn set_device_config(
        &self,
        config: &TunnelConfig,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Keeps the engine's own sockets off the tunnel when it carries the
    /// default route.
    fn bind_default_routes(
        &self,
        config: &TunnelConfig,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Addresses, MTU, routes and DNS.
    fn configure_interface(
        &self,
        config: &TunnelConfig,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn peer_stats(&self) -> impl Future<Output = anyhow::Result<HashMap<Key, PeerStats>>> + Send;

    /// Tears everything down. Safe to call after a partial setup.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Merges live peer statistics into the configuration a worker was started
/// with.
pub fn with_peer_stats(mut config: TunnelConfig, stats: &HashMap<Key, PeerStats>) -> TunnelConfig {
    for peer in &mut config.peers {
        peer.stats = stats.get(&peer.public_key).cloned();
    }
    config
}

const SOCKET_WAIT: Duration = Duration::from_secs(5);
const FWMARK: u32 = 51820;

struct RunningEngine {
    child: Child,
    interface_name: String,
    socket: PathBuf,
    capture: CancellationToken,
    routed_all: bool,
    dns_set: bool,
}

/// Runs a userspace engine binary that creates `<interface>` and serves its
/// configuration socket at `<socket_directory>/<interface>.sock`.
pub struct CommandEngine {
    binary: PathBuf,
    socket_directory: PathBuf,
    log_directory: PathBuf,
    running: tokio::sync::Mutex<Option<RunningEngine>>,
}

impl CommandEngine {
    pub fn new(binary: PathBuf, socket_directory: PathBuf, log_directory: PathBuf) -> Self {
        Self {
            binary,
            socket_directory,
            log_directory,
            running: tokio::sync::Mutex::new(None),
        }
    }

    async fn socket(&self) -> anyhow::Result<PathBuf> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.socket.clone())
            .context("The tunnel engine is not running")
    }

    async fn request(&self, request: &str) -> anyhow::Result<String> {
        let socket = self.socket().await?;
        let stream = transport::connect(&socket).await?;
        uapi::exchange(stream, request).await
    }
}

async fn wait_for_socket(child: &mut Child, socket: &Path) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
    while !socket.exists() {
        if let Some(status) = child.try_wait()? {
            bail!("Tunnel engine exited during startup with {}", status);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "Tunnel engine did not create {} within {:?}",
                socket.display(),
                SOCKET_WAIT
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

#[cfg(unix)]
fn interface_index(interface_name: &str) -> anyhow::Result<AdapterId> {
    let index = nix::net::if_::if_nametoindex(interface_name)
        .with_context(|| format!("No interface named {}", interface_name))?;
    Ok(AdapterId(u64::from(index)))
}

#[cfg(not(unix))]
fn interface_index(interface_name: &str) -> anyhow::Result<AdapterId> {
    bail!(
        "Looking up interface {} is not supported on this platform",
        interface_name
    )
}

impl TunnelEngine for CommandEngine {
    async fn create_adapter(&self, name: &TunnelName) -> anyhow::Result<Adapter> {
        let interface_name = name.as_str().to_string();
        let socket = self.socket_directory.join(format!("{}.sock", interface_name));

        tracing::info!(
            "Starting tunnel engine: {} -f {}",
            self.binary.display(),
            interface_name
        );
        let mut child = Command::new(&self.binary)
            .arg("-f")
            .arg(&interface_name)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.binary.display()))?;

        let capture = CancellationToken::new();
        capture_child_output(
            &mut child,
            &self.log_directory,
            &format!("engine-{}", name),
            capture.clone(),
            |_| {},
        )
        .await?;

        wait_for_socket(&mut child, &socket).await?;
        let id = interface_index(&interface_name)?;

        *self.running.lock().await = Some(RunningEngine {
            child,
            interface_name: interface_name.clone(),
            socket,
            capture,
            routed_all: false,
            dns_set: false,
        });
        Ok(Adapter { id, interface_name })
    }

    async fn set_device_config(&self, config: &TunnelConfig) -> anyhow::Result<()> {
        let response = self.request(&uapi::set_request(config)).await?;
        uapi::check_errno(&response)
    }

    async fn bind_default_routes(&self, config: &TunnelConfig) -> anyhow::Result<()> {
        if !config.routes_all_traffic() {
            return Ok(());
        }
        let response = self.request(&uapi::fwmark_request(FWMARK)).await?;
        uapi::check_errno(&response)?;

        let mut running = self.running.lock().await;
        let running = running.as_mut().context("The tunnel engine is not running")?;
        netconfig::add_policy_rules(FWMARK).await?;
        running.routed_all = true;
        Ok(())
    }

    async fn configure_interface(&self, config: &TunnelConfig) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        let running = running.as_mut().context("The tunnel engine is not running")?;
        let table = running.routed_all.then_some(FWMARK);
        netconfig::configure(&running.interface_name, config, table).await?;
        if !config.interface.dns.is_empty() {
            netconfig::set_dns(&running.interface_name, &config.interface.dns).await?;
            running.dns_set = true;
        }
        Ok(())
    }

    async fn peer_stats(&self) -> anyhow::Result<HashMap<Key, PeerStats>> {
        let response = self.request(uapi::GET_REQUEST).await?;
        uapi::parse_peer_stats(&response)
    }

    async fn close(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        if running.dns_set {
            netconfig::clear_dns(&running.interface_name).await;
        }
        if running.routed_all {
            netconfig::remove_policy_rules(FWMARK).await;
        }
        if let Err(e) = running.child.start_kill() {
            tracing::warn!("Failed to stop tunnel engine: {}", e);
        }
        let _ = running.child.wait().await;
        running.capture.cancel();
        tracing::info!("Tunnel engine for {} stopped", running.interface_name);
    }
}

#[cfg(target_os = "linux")]
mod netconfig {
    use crate::conf::TunnelConfig;
    use anyhow::Context;
    use std::net::IpAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::process::Command;

    async fn ip(args: &[&str]) -> anyhow::Result<()> {
        tracing::debug!("ip {}", args.join(" "));
        let status = Command::new("ip")
            .args(args)
            .status()
            .await
            .context("Failed to run ip")?;
        anyhow::ensure!(status.success(), "ip {} exited with {}", args.join(" "), status);
        Ok(())
    }

    pub async fn configure(
        interface: &str,
        config: &TunnelConfig,
        table: Option<u32>,
    ) -> anyhow::Result<()> {
        for address in &config.interface.addresses {
            let family = if address.addr.is_ipv6() { "-6" } else { "-4" };
            let address = address.to_string();
            ip(&[family, "address", "add", address.as_str(), "dev", interface]).await?;
        }

        let mtu = config.interface.mtu.unwrap_or(1420).to_string();
        ip(&["link", "set", "mtu", mtu.as_str(), "up", "dev", interface]).await?;

        let table = table.map(|t| t.to_string());
        for peer in &config.peers {
            for allowed in &peer.allowed_ips {
                let family = if allowed.addr.is_ipv6() { "-6" } else { "-4" };
                let route = allowed.to_string();
                let mut args = vec![family, "route", "add", route.as_str(), "dev", interface];
                if allowed.is_default_route()
                    && let Some(ref table) = table
                {
                    args.extend(["table", table.as_str()]);
                }
                ip(&args).await?;
            }
        }
        Ok(())
    }

    pub async fn add_policy_rules(mark: u32) -> anyhow::Result<()> {
        let mark = mark.to_string();
        for family in ["-4", "-6"] {
            ip(&[family, "rule", "add", "not", "fwmark", mark.as_str(), "table", mark.as_str()]).await?;
            ip(&[family, "rule", "add", "table", "main", "suppress_prefixlength", "0"]).await?;
        }
        Ok(())
    }

    pub async fn remove_policy_rules(mark: u32) {
        let mark = mark.to_string();
        for family in ["-4", "-6"] {
            let removed = async {
                ip(&[family, "rule", "del", "not", "fwmark", mark.as_str(), "table", mark.as_str()]).await?;
                ip(&[family, "rule", "del", "table", "main", "suppress_prefixlength", "0"]).await
            };
            if let Err(e) = removed.await {
                tracing::warn!("Unable to remove routing rules: {:#}", e);
            }
        }
    }

    pub async fn set_dns(interface: &str, servers: &[IpAddr]) -> anyhow::Result<()> {
        let mut child = Command::new("resolvconf")
            .args(["-a", interface, "-m", "0", "-x"])
            .stdin(std::process::Stdio::piped())
            .spawn()
            .context("Failed to run resolvconf")?;
        if let Some(mut stdin) = child.stdin.take() {
            for server in servers {
                stdin
                    .write_all(format!("nameserver {}\n", server).as_bytes())
                    .await
                    .context("Failed to write to resolvconf")?;
            }
        }
        let status = child.wait().await.context("Failed to run resolvconf")?;
        anyhow::ensure!(status.success(), "resolvconf exited with {}", status);
        Ok(())
    }

    pub async fn clear_dns(interface: &str) {
        let cleared = Command::new("resolvconf")
            .args(["-d", interface, "-f"])
            .status()
            .await;
        if let Err(e) = cleared {
            tracing::warn!("Unable to remove DNS configuration: {}", e);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod netconfig {
    use crate::conf::TunnelConfig;
    use std::net::IpAddr;

    pub async fn configure(
        interface: &str,
        _config: &TunnelConfig,
        _table: Option<u32>,
    ) -> anyhow::Result<()> {
        anyhow::bail!(
            "Configuring interface {} is not supported on this platform",
            interface
        )
    }

    pub async fn add_policy_rules(_mark: u32) -> anyhow::Result<()> {
        anyhow::bail!("Policy routing is not supported on this platform")
    }

    pub async fn remove_policy_rules(_mark: u32) {}

    pub async fn set_dns(interface: &str, _servers: &[IpAddr]) -> anyhow::Result<()> {
        anyhow::bail!("Setting DNS on {} is not supported on this platform", interface)
    }

    pub async fn clear_dns(_interface: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum EngineStep {
    CreateAdapter,
    SetDeviceConfig,
    BindDefaultRoutes,
    ConfigureInterface,
    Close,
}

/// Engine that only records what it was asked to do.
#[derive(Default)]
pub struct MockEngine {
    steps: Mutex<Vec<EngineStep>>,
    fail_at: Option<EngineStep>,
    device: Mutex<Option<TunnelConfig>>,
    stats: Mutex<HashMap<Key, PeerStats>>,
}

impl MockEngine {
    pub fn failing_at(step: EngineStep) -> Self {
        Self {
            fail_at: Some(step),
            ..Default::default()
        }
    }

    pub fn steps(&self) -> Vec<EngineStep> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_stats(&self, peer: Key, stats: PeerStats) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, stats);
    }

    fn step(&self, step: EngineStep) -> anyhow::Result<()> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step);
        if self.fail_at == Some(step) {
            bail!("Mock engine failure at {}", step);
        }
        Ok(())
    }
}

impl TunnelEngine for MockEngine {
    async fn create_adapter(&self, name: &TunnelName) -> anyhow::Result<Adapter> {
        self.step(EngineStep::CreateAdapter)?;
        Ok(Adapter {
            id: AdapterId(1),
            interface_name: name.as_str().to_string(),
        })
    }

    async fn set_device_config(&self, config: &TunnelConfig) -> anyhow::Result<()> {
        self.step(EngineStep::SetDeviceConfig)?;
        *self.device.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }

    async fn bind_default_routes(&self, _config: &TunnelConfig) -> anyhow::Result<()> {
        self.step(EngineStep::BindDefaultRoutes)
    }

    async fn configure_interface(&self, _config: &TunnelConfig) -> anyhow::Result<()> {
        self.step(EngineStep::ConfigureInterface)
    }

    async fn peer_stats(&self) -> anyhow::Result<HashMap<Key, PeerStats>> {
        anyhow::ensure!(
            self.device
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
            "The device has not been configured"
        );
        Ok(self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn close(&self) {
        let _ = self.step(EngineStep::Close);
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::config::tests::sample_config;

    #[test]
    fn test_peer_stats_merged_by_key() {
        let config = sample_config("office");
        let peer = config.peers[0].public_key;
        let mut stats = HashMap::new();
        stats.insert(
            peer,
            PeerStats {
                rx_bytes: 5,
                tx_bytes: 6,
                last_handshake_unix: None,
            },
        );
        stats.insert(Key::from_bytes([4u8; 32]), PeerStats::default());

        let merged = with_peer_stats(config, &stats);
        assert_eq!(merged.peers.len(), 1);
        assert_eq!(merged.peers[0].stats.as_ref().unwrap().tx_bytes, 6);
    }

    #[tokio::test]
    async fn test_mock_engine_failure_injection() {
        let engine = MockEngine::failing_at(EngineStep::SetDeviceConfig);
        let name = TunnelName::new("office").unwrap();
        engine.create_adapter(&name).await.unwrap();
        assert!(engine.set_device_config(&sample_config("office")).await.is_err());
        assert!(engine.peer_stats().await.is_err());
        assert_eq!(
            engine.steps(),
            vec![EngineStep::CreateAdapter, EngineStep::SetDeviceConfig]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_engine_missing_binary() {
        let dir = std::env::temp_dir().join(format!("tunnel_manager_test_{}", uuid::Uuid::new_v4()));
        let engine = CommandEngine::new(dir.join("no-such-engine"), dir.clone(), dir.clone());
        let name = TunnelName::new("office").unwrap();
        assert!(engine.create_adapter(&name).await.is_err());
        assert!(engine.peer_stats().await.is_err());
        engine.close().await;
    }
}
