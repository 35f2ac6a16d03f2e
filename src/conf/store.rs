use crate::conf::config::TunnelConfig;
use crate::conf::name::{TunnelName, natural_cmp};
use crate::constants::CONFIG_FILE_SUFFIX;
use crate::errors;
use anyhow::{Context, ensure};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::mpsc;

/// Writes `contents` next to `path` and renames it into place, so readers
/// never observe a half-written file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| errors::config::failed_to_create_dir(&parent.display().to_string()))?;

    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, contents)
        .await
        .with_context(|| errors::config::failed_to_write_temp(&tmp_path.display().to_string()))
        .map_err(|e| {
            if e.to_string().contains("No space left on device")
                || e.to_string().contains("disk full")
            {
                anyhow::anyhow!(errors::disk::FULL)
            } else {
                e
            }
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .await
            .context(errors::config::FAILED_TO_SET_PERMISSIONS)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await
            .context(errors::config::FAILED_TO_OPEN_TEMP)?;
        file.sync_all()
            .await
            .context(errors::config::FAILED_TO_FSYNC)?;
    }

    fs::rename(&tmp_path, path).await.with_context(|| {
        errors::config::failed_to_rename(
            &tmp_path.display().to_string(),
            &path.display().to_string(),
        )
    })?;

    Ok(())
}

pub async fn load_from_path(path: &Path) -> anyhow::Result<TunnelConfig> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| errors::config::failed_to_read(&path.display().to_string()))?;
    let config: TunnelConfig = serde_yaml::from_str(&contents)
        .with_context(|| errors::config::failed_to_parse(&path.display().to_string()))?;
    config
        .validate()
        .with_context(|| errors::config::validation_failed(&path.display().to_string()))?;
    Ok(config)
}

/// One YAML document per tunnel, named `<name>.conf.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    directory: PathBuf,
}

impl ConfigStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_of(&self, name: &TunnelName) -> PathBuf {
        self.directory
            .join(format!("{}{}", name.as_str(), CONFIG_FILE_SUFFIX))
    }

    pub async fn save(&self, config: &TunnelConfig) -> anyhow::Result<PathBuf> {
        config.validate().with_context(|| {
            errors::config::validation_failed(config.name.as_str())
        })?;

        let stored = config.clone().without_runtime_stats();
        let yaml = serde_yaml::to_string(&stored).context(errors::config::FAILED_TO_SERIALIZE)?;
        let path = self.path_of(&config.name);
        write_atomic(&path, yaml.as_bytes()).await?;

        tracing::info!("Saved configuration for tunnel '{}'", config.name);
        Ok(path)
    }

    pub async fn load(&self, name: &TunnelName) -> anyhow::Result<TunnelConfig> {
        let config = load_from_path(&self.path_of(name)).await?;
        ensure!(
            &config.name == name,
            errors::config::name_mismatch(name.as_str())
        );
        Ok(config)
    }

    pub async fn exists(&self, name: &TunnelName) -> bool {
        fs::try_exists(self.path_of(name)).await.unwrap_or(false)
    }

    pub async fn delete(&self, name: &TunnelName) -> anyhow::Result<()> {
        let path = self.path_of(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("Deleted configuration for tunnel '{}'", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(anyhow::anyhow!(errors::tunnel::not_found(name.as_str())))
            }
            Err(e) => Err(e)
                .with_context(|| errors::config::failed_to_delete(&path.display().to_string())),
        }
    }

    /// Lists stored tunnels in natural order. Entries that are not regular
    /// files, have the wrong suffix or carry an invalid name are skipped.
    pub async fn list_config_names(&self) -> anyhow::Result<Vec<TunnelName>> {
        let mut read_dir = match fs::read_dir(&self.directory).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    errors::config::failed_to_list(&self.directory.display().to_string())
                });
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(CONFIG_FILE_SUFFIX) else {
                continue;
            };
            match TunnelName::new(stem) {
                Ok(name) => names.push(name),
                Err(e) => tracing::debug!("Skipping {}: {}", file_name, e),
            }
        }

        names.sort_by(|a, b| natural_cmp(a.as_str(), b.as_str()));
        Ok(names)
    }

    pub fn watch(&self) -> anyhow::Result<StoreWatcher> {
        std::fs::create_dir_all(&self.directory).with_context(|| {
            errors::config::failed_to_create_dir(&self.directory.display().to_string())
        })?;

        let (tx, rx) = mpsc::channel(10);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .context(errors::config::FAILED_TO_CREATE_WATCHER)?;

        watcher
            .watch(&self.directory, RecursiveMode::NonRecursive)
            .with_context(|| {
                errors::config::failed_to_watch(&self.directory.display().to_string())
            })?;

        Ok(StoreWatcher {
            _watcher: watcher,
            rx,
        })
    }
}

pub struct StoreWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
}

impl StoreWatcher {
    /// Resolves once a tunnel configuration file appears, disappears or is
    /// rewritten. Returns `None` when the watcher has shut down.
    pub async fn changed(&mut self) -> Option<()> {
        loop {
            match self.rx.recv().await? {
                Ok(event) if is_config_event(&event) => return Some(()),
                Ok(_) => continue,
                Err(e) => tracing::warn!("Configuration watcher error: {}", e),
            }
        }
    }
}

fn is_config_event(event: &Event) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
    );
    relevant_kind
        && event.paths.iter().any(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CONFIG_FILE_SUFFIX))
        })
}
