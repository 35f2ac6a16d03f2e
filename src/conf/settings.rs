use crate::conf::store::write_atomic;
use crate::constants::{
    PIPE_NAMESPACE, default_config_directory, default_log_directory, default_socket_path,
};
use crate::errors;
use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_config_directory")]
    pub config_directory: PathBuf,

    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,

    #[serde(default)]
    pub log_retention_days: Option<u32>,

    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Where tunnel workers expose their runtime configuration endpoints.
    #[serde(default = "default_runtime_directory")]
    pub runtime_directory: PathBuf,

    #[serde(default)]
    pub engine_binary_path: Option<PathBuf>,

    /// Launched once per interactive administrator session.
    #[serde(default)]
    pub ui_command: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub update_checks: bool,

    #[serde(default = "default_true")]
    pub stop_tunnels_on_quit: bool,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_runtime_directory() -> PathBuf {
    PathBuf::from(PIPE_NAMESPACE)
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            version: default_version(),
            config_directory: default_config_directory(),
            log_directory: default_log_directory(),
            log_retention_days: None,
            socket_path: default_socket_path(),
            runtime_directory: default_runtime_directory(),
            engine_binary_path: None,
            ui_command: None,
            update_checks: true,
            stop_tunnels_on_quit: true,
        }
    }
}

impl ManagerSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.version == 1,
            errors::config::unsupported_version(self.version)
        );

        if let Some(ref path) = self.engine_binary_path {
            ensure!(
                path.exists(),
                errors::binary::not_found(&path.display().to_string())
            );
        }

        if let Some(ref path) = self.ui_command {
            ensure!(
                path.exists(),
                errors::binary::not_found(&path.display().to_string())
            );
        }

        if let Some(days) = self.log_retention_days {
            ensure!(
                (1..=3650).contains(&days),
                errors::logs::retention_invalid(days)
            );
        }

        Ok(())
    }
}

pub async fn load_settings(path: &Path) -> anyhow::Result<ManagerSettings> {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_yaml::from_str::<ManagerSettings>(&contents) {
            Ok(settings) => {
                settings
                    .validate()
                    .with_context(|| errors::config::validation_failed(&path.display().to_string()))?;
                Ok(settings)
            }
            Err(parse_error) => {
                tracing::error!(
                    "{}",
                    errors::config::corrupted_yaml(
                        &path.display().to_string(),
                        &parse_error.to_string()
                    )
                );

                let backup_path = path.with_extension("yaml.bak");
                if let Err(e) = fs::copy(path, &backup_path).await {
                    tracing::warn!("Failed to create backup of corrupted settings: {}", e);
                } else {
                    tracing::info!(
                        "{}",
                        errors::config::backup_created(&backup_path.display().to_string())
                    );
                }

                save_settings(path, &ManagerSettings::default())
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to create new settings after corruption at {}",
                            path.display()
                        )
                    })?;

                Err(anyhow::anyhow!(errors::config::corrupted(
                    &backup_path.display().to_string(),
                    &parse_error.to_string()
                )))
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let settings = ManagerSettings::default();
            save_settings(path, &settings).await.with_context(|| {
                errors::config::failed_to_create_default(&path.display().to_string())
            })?;
            Ok(settings)
        }
        Err(e) => {
            Err(e).with_context(|| errors::config::failed_to_read(&path.display().to_string()))
        }
    }
}

pub async fn save_settings(path: &Path, settings: &ManagerSettings) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(settings).context(errors::config::FAILED_TO_SERIALIZE)?;
    write_atomic(path, yaml.as_bytes()).await
}

pub async fn cleanup_old_logs(log_directory: &Path, retention_days: u32) -> anyhow::Result<()> {
    let cutoff_time = std::time::SystemTime::now()
        - std::time::Duration::from_secs(retention_days as u64 * 24 * 60 * 60);

    let mut read_dir = fs::read_dir(log_directory).await.with_context(|| {
        errors::logs::failed_to_read_dir(&log_directory.display().to_string())
    })?;

    let mut deleted_count = 0;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("log")
            && let Ok(metadata) = entry.metadata().await
            && let Ok(modified) = metadata.modified()
            && modified < cutoff_time
        {
            match fs::remove_file(&path).await {
                Ok(_) => {
                    tracing::info!("Deleted old log file: {}", path.display());
                    deleted_count += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to delete old log file {}: {}", path.display(), e);
                }
            }
        }
    }

    if deleted_count > 0 {
        tracing::info!("Cleaned up {} old log files", deleted_count);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!(
            "tunnel_manager_settings_test_{}",
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn test_missing_settings_written_with_defaults() {
        let dir = temp_dir();
        let path = dir.join("tunnel_manager.yaml");

        let settings = load_settings(&path).await.unwrap();
        assert_eq!(settings, ManagerSettings::default());
        assert!(path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_corrupted_settings_backed_up() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tunnel_manager.yaml");
        std::fs::write(&path, "version: [unterminated").unwrap();

        let err = load_settings(&path).await.unwrap_err();
        assert!(err.to_string().contains("corrupted"));
        assert!(path.with_extension("yaml.bak").exists());

        let reloaded = load_settings(&path).await.unwrap();
        assert_eq!(reloaded, ManagerSettings::default());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_validate_retention_range() {
        let settings = ManagerSettings {
            log_retention_days: Some(0),
            ..Default::default()
        };
        let result = settings.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("retention"));
    }

    #[test]
    fn test_validate_unsupported_version() {
        let settings = ManagerSettings {
            version: 2,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let settings: ManagerSettings =
            serde_yaml::from_str("update_checks: false\n").unwrap();
        assert!(!settings.update_checks);
        assert!(settings.stop_tunnels_on_quit);
        assert_eq!(settings.config_directory, default_config_directory());
    }
}
