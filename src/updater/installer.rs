use crate::elevate::Environment;
use std::path::Path;

/// Runs a verified package. Called with the elevated environment.
pub trait Installer: Send + Sync + 'static {
    fn install(&self, artifact: &Path, environment: &Environment) -> anyhow::Result<()>;
}

#[cfg(windows)]
pub type NativeInstaller = MsiInstaller;
#[cfg(not(windows))]
pub type NativeInstaller = DryRunInstaller;

pub fn native_installer() -> NativeInstaller {
    NativeInstaller::default()
}

#[cfg(windows)]
#[derive(Debug, Default)]
pub struct MsiInstaller;

/// Runs msiexec under the calling thread's identity. Called from inside the
/// elevated context, so the package is installed by that identity rather
/// than by whatever account started this process.
#[cfg(windows)]
impl Installer for MsiInstaller {
    fn install(&self, artifact: &Path, environment: &Environment) -> anyhow::Result<()> {
        use crate::elevate::user_process::{SpawnRequest, effective_primary_token, spawn_as};
        use anyhow::Context;

        let system_root = environment
            .get("SystemRoot")
            .or_else(|| environment.get("SYSTEMROOT"))
            .context("SystemRoot is not set in the elevated environment")?;
        let msiexec = Path::new(system_root).join("System32").join("msiexec.exe");

        let token = effective_primary_token()
            .context("Unable to take the token of the elevated identity")?;
        tracing::info!("Running {} on {}", msiexec.display(), artifact.display());
        let process = spawn_as(
            &token,
            SpawnRequest {
                program: &msiexec,
                arguments: vec![
                    "/qb!-".to_string(),
                    "/i".to_string(),
                    artifact.to_string_lossy().into_owned(),
                ],
                environment: Some(environment),
                desktop: None,
                capture_output: false,
            },
        )
        .with_context(|| format!("Failed to launch {}", msiexec.display()))?;

        let code = process
            .wait_blocking()
            .with_context(|| format!("Failed to wait for {}", msiexec.display()))?;
        anyhow::ensure!(code == 0, "msiexec exited with {}", code);
        Ok(())
    }
}

/// Logs the command that would run. Used where packages cannot be
/// installed in place.
#[derive(Debug, Default)]
pub struct DryRunInstaller;

impl Installer for DryRunInstaller {
    fn install(&self, artifact: &Path, _environment: &Environment) -> anyhow::Result<()> {
        tracing::info!(
            "Would execute: msiexec /qb!- /i {}",
            artifact.display()
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingInstaller {
        pub(crate) installed: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    }

    impl Installer for RecordingInstaller {
        fn install(&self, artifact: &Path, _environment: &Environment) -> anyhow::Result<()> {
            let contents = std::fs::read(artifact)?;
            self.installed
                .lock()
                .unwrap()
                .push((artifact.to_path_buf(), contents));
            Ok(())
        }
    }

    /// Fails the way msiexec does when a package cannot be applied.
    pub(crate) struct FailingInstaller;

    impl Installer for FailingInstaller {
        fn install(&self, artifact: &Path, _environment: &Environment) -> anyhow::Result<()> {
            anyhow::ensure!(artifact.exists(), "Artifact is missing");
            anyhow::bail!("msiexec exited with 1603")
        }
    }

    #[test]
    fn test_dry_run_succeeds() {
        let result = DryRunInstaller.install(Path::new("/tmp/update.msi"), &Environment::new());
        assert!(result.is_ok());
    }
}
