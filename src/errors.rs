pub mod tunnel {
    pub fn not_found(name: &str) -> String {
        format!("Tunnel '{}' not found", name)
    }

    pub fn not_running(name: &str) -> String {
        format!("Tunnel '{}' is not running", name)
    }

    pub fn transitional_state(name: &str) -> String {
        format!(
            "Tunnel '{}' is currently starting or stopping. Please wait.",
            name
        )
    }

    pub fn running_overwrite(name: &str) -> String {
        format!(
            "Cannot replace the configuration of tunnel '{}' while it is running. Stop the tunnel first.",
            name
        )
    }

    pub fn failed_to_start(name: &str) -> String {
        format!("Failed to start tunnel '{}'", name)
    }

    pub fn failed_to_stop(name: &str) -> String {
        format!("Failed to stop tunnel '{}'", name)
    }

    pub fn failed_to_track(name: &str) -> String {
        format!("Unable to track status of tunnel '{}'", name)
    }

    pub fn monitoring_failed(reason: &str) -> String {
        format!("Unable to continue monitoring service, so stopping: {}", reason)
    }

    pub fn runtime_config_failed(name: &str) -> String {
        format!("Unable to read runtime configuration of tunnel '{}'", name)
    }

    pub fn runtime_config_timeout(name: &str) -> String {
        format!(
            "Timed out reading runtime configuration of tunnel '{}'",
            name
        )
    }

    pub const STOP_BEFORE_DELETE: &str = "Unable to stop tunnel before deleting";
    pub const TRACK_EXISTING_FAILED: &str = "Unable to track existing tunnels";
}

pub mod session {
    pub const LOGGED_OUT: &str = "Session has logged out";
}

pub mod binary {
    pub fn not_found(path: &str) -> String {
        format!(
            "Executable not found at path: {}. Please check the configured path.",
            path
        )
    }

    pub fn permission_denied(path: &str) -> String {
        format!(
            "Permission denied executing {}. Check file permissions.",
            path
        )
    }
}

pub mod config {
    pub fn validation_failed(context: &str) -> String {
        format!("Config validation failed for {}", context)
    }

    pub fn corrupted(backup_path: &str, error: &str) -> String {
        format!(
            "Settings file was corrupted and has been replaced with defaults. Backup saved to {}. Error: {}",
            backup_path, error
        )
    }

    pub fn corrupted_yaml(path: &str, error: &str) -> String {
        format!("Corrupted YAML config at {}: {}", path, error)
    }

    pub fn backup_created(path: &str) -> String {
        format!("Created backup of corrupted config at {}", path)
    }

    pub fn unsupported_version(version: u32) -> String {
        format!(
            "Unsupported config version: {}. Expected version 1",
            version
        )
    }

    pub fn failed_to_create_default(path: &str) -> String {
        format!("Failed to create default config at {}", path)
    }

    pub fn failed_to_read(path: &str) -> String {
        format!("Failed to read config from {}", path)
    }

    pub fn failed_to_parse(path: &str) -> String {
        format!("Failed to parse tunnel configuration at {}", path)
    }

    pub fn name_mismatch(name: &str) -> String {
        format!(
            "Stored configuration for '{}' names a different tunnel",
            name
        )
    }

    pub fn failed_to_delete(path: &str) -> String {
        format!("Failed to delete configuration file {}", path)
    }

    pub fn failed_to_list(path: &str) -> String {
        format!("Failed to list configurations in {}", path)
    }

    pub const FAILED_TO_SERIALIZE: &str = "Failed to serialize config to YAML";

    pub fn failed_to_create_dir(path: &str) -> String {
        format!("Failed to create config directory: {}", path)
    }

    pub fn failed_to_write_temp(path: &str) -> String {
        format!("Failed to write temporary config to {}", path)
    }

    pub fn failed_to_rename(from: &str, to: &str) -> String {
        format!("Failed to rename {} to {}", from, to)
    }

    #[cfg(unix)]
    pub const FAILED_TO_SET_PERMISSIONS: &str = "Failed to restrict permissions of temp file";
    #[cfg(unix)]
    pub const FAILED_TO_OPEN_TEMP: &str = "Failed to open temp file for fsync";
    #[cfg(unix)]
    pub const FAILED_TO_FSYNC: &str = "Failed to fsync temp file";
    pub const FAILED_TO_CREATE_WATCHER: &str = "Failed to create file watcher";

    pub fn failed_to_watch(path: &str) -> String {
        format!("Failed to watch config directory: {}", path)
    }
}

pub mod disk {
    pub const FULL: &str =
        "Disk space exhausted. Cannot save configuration. Free up disk space and try again.";

    pub fn full_log_write(path: &str) -> String {
        format!("Disk full - cannot write to log file: {}", path)
    }
}

pub mod logs {
    pub const FAILED_TO_CREATE_DIR: &str = "Failed to create log directory";

    pub const FAILED_TO_CREATE_FILE: &str = "Failed to create log file";

    pub fn failed_to_write(stream: &str, error: &str) -> String {
        format!("Failed to write {} to log: {}", stream, error)
    }

    pub fn failed_to_flush(error: &str) -> String {
        format!("Failed to flush log file: {}", error)
    }

    pub fn failed_to_read_dir(path: &str) -> String {
        format!("Failed to read log directory {}", path)
    }

    pub fn retention_invalid(days: u32) -> String {
        format!(
            "Log retention days must be between 1 and 3650 (10 years), got: {}",
            days
        )
    }
}

pub mod process {
    pub fn spawn_failed(error: &str) -> String {
        format!("Failed to spawn process: {}", error)
    }

    pub const FAILED_TO_GET_PID: &str = "Failed to get process ID";
    pub const FAILED_TO_CAPTURE_STDOUT: &str = "Failed to capture stdout";
    pub const FAILED_TO_CAPTURE_STDERR: &str = "Failed to capture stderr";
}

pub mod ipc {
    pub const MISSING_HELLO: &str = "Connection closed before greeting";
    pub const CONNECTION_CLOSED: &str = "Connection closed by peer";
    pub const FAILED_TO_ACCEPT: &str = "Failed to accept connection";
    pub const FAILED_TO_ENCODE: &str = "Failed to encode message";
    pub const FAILED_TO_DECODE: &str = "Failed to decode message";
    pub const FAILED_TO_READ: &str = "Failed to read from connection";
    pub const FAILED_TO_WRITE: &str = "Failed to write to connection";
    pub const TRUNCATED_FRAME: &str = "Connection closed in the middle of a message";

    pub fn version_mismatch(got: u32, expected: u32) -> String {
        format!(
            "Protocol version mismatch: client speaks {}, manager speaks {}",
            got, expected
        )
    }

    pub fn unknown_connection(connection: &str) -> String {
        format!("Unknown control connection {}", connection)
    }

    pub fn frame_too_large(length: usize) -> String {
        format!("Message of {} bytes exceeds the frame limit", length)
    }

    pub fn failed_to_bind(path: &str) -> String {
        format!("Failed to listen on {}", path)
    }

    pub fn failed_to_connect(path: &str) -> String {
        format!("Failed to connect to {}", path)
    }

    pub fn failed_to_remove_stale(path: &str) -> String {
        format!("Failed to remove stale socket {}", path)
    }

    pub fn unexpected_response(method: &str, response: &str) -> String {
        format!("Unexpected response to {}: {}", method, response)
    }
}

pub mod update {
    pub const FAILED_TO_CREATE_CLIENT: &str = "Failed to create HTTP client";
    pub const READ_INTERRUPTED: &str = "Download was interrupted";
    pub const FAILED_TO_WRITE_FILE: &str = "Failed to write update file";
    pub const INSTALL_FAILED: &str = "Failed to install update";

    pub fn request_failed(url: &str) -> String {
        format!("Request to {} failed", url)
    }

    pub fn response_too_large(limit: u64) -> String {
        format!("Response is larger than {} bytes", limit)
    }

    pub fn failed_to_create_file(path: &str) -> String {
        format!("Failed to create update file {}", path)
    }

    pub fn failed_to_create_dir(path: &str) -> String {
        format!("Failed to create update directory {}", path)
    }

    pub fn failed_to_rename(from: &str, to: &str) -> String {
        format!("Failed to rename {} to {}", from, to)
    }
}
