use std::path::PathBuf;

pub const APP_NAME: &str = "tunnel_manager";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const SERVICE_NAME_PREFIX: &str = "TunnelManagerTunnel$";
pub const MANAGER_SERVICE_NAME: &str = "TunnelManager";

#[cfg(windows)]
pub const PIPE_NAMESPACE: &str = r"\\.\pipe\ProtectedPrefix\Administrators\TunnelManager\";
#[cfg(not(windows))]
pub const PIPE_NAMESPACE: &str = "/run/tunnel_manager/";

pub const CONFIG_FILE_SUFFIX: &str = ".conf.yaml";

pub const MOCK_ENV_VAR: &str = "TUNNEL_MANAGER_MOCK";

pub mod update {
    pub const LATEST_VERSION_URL: &str = "https://download.tunnel-manager.example/client/latest.sig";
    pub const ARTIFACT_URL_BASE: &str = "https://download.tunnel-manager.example/client/";
    pub const ARTIFACT_PREFIX: &str = "tunnel-manager-";
    pub const ARTIFACT_SUFFIX: &str = ".msi";

    // "Ed" + 8 byte key id + 32 byte Ed25519 public key
    pub const RELEASE_PUBLIC_KEY_BASE64: &str =
        "RWRNqGKtBXftKTKPpBPGDMe8jHLnFQ0EdRy8Wo7yS0RvOSpQXuTDSCBw";

    pub const PROGRESS_QUEUE_DEPTH: usize = 128;
    pub const MANIFEST_READ_LIMIT: u64 = 512 * 1024;
    pub const DOWNLOAD_LIMIT: u64 = 100 * 1024 * 1024;
    pub const MAX_VERSION_LENGTH: usize = 128;
}

pub fn default_log_directory() -> PathBuf {
    PathBuf::from(".").join("logs")
}

pub fn default_config_directory() -> PathBuf {
    PathBuf::from(".").join("tunnels")
}

pub fn default_socket_path() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(r"\\.\pipe\ProtectedPrefix\Administrators\TunnelManager\manager")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from(PIPE_NAMESPACE).join("manager.sock")
    }
}

/// Architecture tag used in artifact names.
pub fn native_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "x86",
        "arm" => "arm",
        other => other,
    }
}

pub fn user_agent() -> String {
    format!(
        "{}/{} ({}; {})",
        APP_NAME,
        APP_VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Printed on stdout by a tunnel worker once its setup has completed.
pub const WORKER_READY_MARKER: &str = "STATUS running";
