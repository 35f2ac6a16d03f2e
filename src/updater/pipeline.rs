use crate::constants::{self, update};
use crate::elevate::{Environment, PrivilegeBroker, TokenPlatform};
use crate::errors;
use crate::manager::types::UpdateState;
use crate::updater::authenticode::{CodeSigner, Revocation, running_build_is_official};
use crate::updater::fetch::{HttpFetcher, read_limited};
use crate::updater::installer::Installer;
use crate::updater::manifest::read_file_list;
use crate::updater::version::find_candidate;
use crate::updater::{DownloadProgress, UpdateError, UpdateFound, UpdateService};
use anyhow::Context;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Blake2b256 = Blake2b<U32>;

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub manifest_url: String,
    pub artifact_url_base: String,
    pub public_key_base64: String,
    pub update_directory: PathBuf,
    pub running_version: String,
    pub arch: String,
    pub artifact_prefix: String,
    pub artifact_suffix: String,
    pub manifest_limit: u64,
    pub download_limit: u64,
}

impl UpdaterConfig {
    /// Release channel settings for this build.
    pub fn official(update_directory: impl Into<PathBuf>) -> Self {
        Self {
            manifest_url: update::LATEST_VERSION_URL.to_string(),
            artifact_url_base: update::ARTIFACT_URL_BASE.to_string(),
            public_key_base64: update::RELEASE_PUBLIC_KEY_BASE64.to_string(),
            update_directory: update_directory.into(),
            running_version: constants::APP_VERSION.to_string(),
            arch: constants::native_arch().to_string(),
            artifact_prefix: update::ARTIFACT_PREFIX.to_string(),
            artifact_suffix: update::ARTIFACT_SUFFIX.to_string(),
            manifest_limit: update::MANIFEST_READ_LIMIT,
            download_limit: update::DOWNLOAD_LIMIT,
        }
    }
}

/// Who downloads and installs. `Current` skips impersonation entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallIdentity {
    System,
    Service(String),
    Current,
}

pub struct Updater<P: TokenPlatform + 'static> {
    inner: Arc<Inner<P>>,
}

struct Inner<P: TokenPlatform + 'static> {
    config: UpdaterConfig,
    fetcher: Arc<dyn HttpFetcher>,
    signer: Arc<dyn CodeSigner>,
    installer: Arc<dyn Installer>,
    broker: Arc<PrivilegeBroker<P>>,
    identity: InstallIdentity,
    official: bool,
    in_progress: AtomicBool,
    state: Mutex<UpdateState>,
    runtime: Handle,
}

/// The partially downloaded file. Emptied and removed unless it was
/// promoted to the verified name first.
struct UnverifiedFile {
    path: PathBuf,
    file: Option<File>,
}

impl UnverifiedFile {
    fn create(path: PathBuf) -> anyhow::Result<Self> {
        let file = File::create(&path)
            .with_context(|| errors::update::failed_to_create_file(&path.display().to_string()))?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        match self.file.as_mut() {
            Some(file) => file
                .write_all(data)
                .context(errors::update::FAILED_TO_WRITE_FILE),
            None => anyhow::bail!(errors::update::FAILED_TO_WRITE_FILE),
        }
    }

    fn promote(mut self, destination: &Path) -> anyhow::Result<VerifiedFile> {
        if let Some(file) = self.file.take() {
            file.sync_all().context(errors::update::FAILED_TO_WRITE_FILE)?;
        }
        std::fs::rename(&self.path, destination).with_context(|| {
            errors::update::failed_to_rename(
                &self.path.display().to_string(),
                &destination.display().to_string(),
            )
        })?;
        Ok(VerifiedFile {
            path: destination.to_path_buf(),
        })
    }
}

impl Drop for UnverifiedFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.set_len(0);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The complete artifact under its final name. Removed when dropped, after
/// the installer has run or failed.
struct VerifiedFile {
    path: PathBuf,
}

impl Drop for VerifiedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Unable to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Owned by SYSTEM, full control for SYSTEM, read-only for Administrators,
/// nothing inherited from the parent.
#[cfg(windows)]
const UPDATE_DIRECTORY_SDDL: &str = "O:SYD:PAI(A;;FA;;;SY)(A;;FR;;;BA)";

fn recreate_update_directory(directory: &Path) -> anyhow::Result<()> {
    // Leftovers from earlier attempts are never reused.
    let _ = std::fs::remove_dir_all(directory);

    #[cfg(windows)]
    {
        if let Some(parent) = directory.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                errors::update::failed_to_create_dir(&parent.display().to_string())
            })?;
        }
        create_directory_with_sddl(directory, UPDATE_DIRECTORY_SDDL)
            .with_context(|| errors::update::failed_to_create_dir(&directory.display().to_string()))
    }
    #[cfg(not(windows))]
    {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(directory)
            .with_context(|| errors::update::failed_to_create_dir(&directory.display().to_string()))
    }
}

#[cfg(windows)]
fn create_directory_with_sddl(directory: &Path, sddl: &str) -> anyhow::Result<()> {
    use windows::Win32::Foundation::{HLOCAL, LocalFree};
    use windows::Win32::Security::Authorization::{
        ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
    use windows::Win32::Storage::FileSystem::CreateDirectoryW;
    use windows::core::HSTRING;

    let mut descriptor = PSECURITY_DESCRIPTOR::default();
    unsafe {
        ConvertStringSecurityDescriptorToSecurityDescriptorW(
            &HSTRING::from(sddl),
            SDDL_REVISION_1,
            &mut descriptor,
            None,
        )
        .context("ConvertStringSecurityDescriptorToSecurityDescriptor")?;
    }
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor.0,
        bInheritHandle: false.into(),
    };
    let created = unsafe {
        CreateDirectoryW(
            &HSTRING::from(directory.as_os_str()),
            Some(&attributes as *const _),
        )
    };
    unsafe {
        let _ = LocalFree(HLOCAL(descriptor.0));
    }
    created.context("CreateDirectory")?;
    Ok(())
}

fn validate_artifact_name(name: &str) -> Result<(), UpdateError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ':'])
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(UpdateError::InvalidName(name.to_string()))
    }
}

impl<P: TokenPlatform + 'static> Updater<P> {
    pub fn new(
        config: UpdaterConfig,
        fetcher: Arc<dyn HttpFetcher>,
        signer: Arc<dyn CodeSigner>,
        installer: Arc<dyn Installer>,
        broker: Arc<PrivilegeBroker<P>>,
        identity: InstallIdentity,
        runtime: Handle,
    ) -> Self {
        let official = running_build_is_official(signer.as_ref());
        let state = if official {
            UpdateState::Unknown
        } else {
            UpdateState::UpdatesDisabledUnofficialBuild
        };
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                signer,
                installer,
                broker,
                identity,
                official,
                in_progress: AtomicBool::new(false),
                state: Mutex::new(state),
                runtime,
            }),
        }
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.inner.config
    }

    /// Downloads, verifies and installs the newest update. The first item on
    /// the returned channel is always `Initializing`.
    pub fn download_verify_and_execute(
        &self,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<DownloadProgress> {
        let (progress, receiver) = mpsc::channel(update::PROGRESS_QUEUE_DEPTH);
        let _ = progress.try_send(DownloadProgress::activity("Initializing"));

        if self
            .inner
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let _ = progress.try_send(DownloadProgress::failed(UpdateError::AlreadyInProgress));
            return receiver;
        }

        let inner = self.inner.clone();
        let failure = progress.clone();
        let spawned = std::thread::Builder::new()
            .name("updater".to_string())
            .spawn(move || inner.run(progress, cancel));
        if let Err(e) = spawned {
            tracing::error!("Unable to start update thread: {}", e);
            self.inner.in_progress.store(false, Ordering::SeqCst);
            let _ = failure.try_send(DownloadProgress::failed(e));
        }
        receiver
    }
}

impl<P: TokenPlatform + 'static> Inner<P> {
    async fn check(&self) -> anyhow::Result<Option<UpdateFound>> {
        let body = self.fetcher.get(&self.config.manifest_url).await?;
        let data = read_limited(body, self.config.manifest_limit).await?;
        let files = read_file_list(&data, &self.config.public_key_base64)?;
        let found = find_candidate(
            &files,
            &self.config.artifact_prefix,
            &self.config.arch,
            &self.config.artifact_suffix,
            &self.config.running_version,
        )?;
        Ok(found)
    }

    fn run(&self, progress: mpsc::Sender<DownloadProgress>, cancel: CancellationToken) {
        let result = match &self.identity {
            InstallIdentity::System => self
                .broker
                .with_system_identity(|ctx| self.execute(ctx.environment(), &progress, &cancel))
                .map_err(anyhow::Error::from)
                .and_then(|result| result),
            InstallIdentity::Service(name) => self
                .broker
                .with_service_identity(name, |ctx| {
                    self.execute(ctx.environment(), &progress, &cancel)
                })
                .map_err(anyhow::Error::from)
                .and_then(|result| result),
            InstallIdentity::Current => {
                let environment: Environment = std::env::vars().collect();
                self.execute(&environment, &progress, &cancel)
            }
        };
        self.in_progress.store(false, Ordering::SeqCst);

        let last = match result {
            Ok(()) => {
                tracing::info!("Update installed");
                DownloadProgress::completed()
            }
            Err(e) => {
                tracing::error!("Update failed: {:#}", e);
                DownloadProgress::failed(format!("{:#}", e))
            }
        };
        let _ = progress.blocking_send(last);
    }

    fn execute(
        &self,
        environment: &Environment,
        progress: &mpsc::Sender<DownloadProgress>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let artifact = self
            .runtime
            .block_on(self.download_and_verify(progress, cancel))?;

        let _ = progress.blocking_send(DownloadProgress::activity("Installing update"));
        self.installer
            .install(&artifact.path, environment)
            .context(errors::update::INSTALL_FAILED)
    }

    async fn download_and_verify(
        &self,
        progress: &mpsc::Sender<DownloadProgress>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<VerifiedFile> {
        let _ = progress
            .send(DownloadProgress::activity("Rechecking for update"))
            .await;
        let update = self.check().await?.ok_or(UpdateError::NoUpdateFound)?;
        validate_artifact_name(&update.name)?;
        tracing::info!("Downloading update {}", update.name);

        let _ = progress
            .send(DownloadProgress::activity("Creating update file"))
            .await;
        recreate_update_directory(&self.config.update_directory)?;
        let destination = self.config.update_directory.join(&update.name);
        let mut unverified =
            UnverifiedFile::create(self.config.update_directory.join(format!("{}.unverified", update.name)))?;

        let mut dp = DownloadProgress::activity("Downloading update");
        let _ = progress.send(dp.clone()).await;

        let url = format!("{}{}", self.config.artifact_url_base, update.name);
        let body = self.fetcher.get(&url).await?;
        let limit = self.config.download_limit;
        if let Some(total) = body.content_length {
            if total > limit {
                return Err(UpdateError::TooLarge(limit).into());
            }
            dp.bytes_total = total;
            let _ = progress.send(dp.clone()).await;
        }

        let mut hasher = Blake2b256::new();
        let mut chunks = body.chunks;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled.into()),
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.context(errors::update::READ_INTERRUPTED)?;
            if dp.bytes_downloaded + chunk.len() as u64 > limit {
                return Err(UpdateError::TooLarge(limit).into());
            }
            unverified.write(&chunk)?;
            hasher.update(&chunk);
            dp.bytes_downloaded += chunk.len() as u64;
            let _ = progress.send(dp.clone()).await;
        }
        if let Some(expected) = body.content_length
            && dp.bytes_downloaded != expected
        {
            return Err(UpdateError::Truncated {
                received: dp.bytes_downloaded,
                expected,
            }
            .into());
        }

        let _ = progress
            .send(DownloadProgress::activity("Verifying update"))
            .await;
        let digest = hasher.finalize();
        if ring::constant_time::verify_slices_are_equal(digest.as_slice(), &update.hash).is_err() {
            return Err(UpdateError::WrongHash.into());
        }
        let artifact = unverified.promote(&destination)?;

        if let Err(e) = self.signer.verify(&artifact.path, Revocation::WholeChain) {
            tracing::warn!("Rejecting {}: {:#}", artifact.path.display(), e);
            return Err(UpdateError::NotAuthentic.into());
        }

        Ok(artifact)
    }
}

impl<P: TokenPlatform + 'static> UpdateService for Updater<P> {
    fn is_official_build(&self) -> bool {
        self.inner.official
    }

    fn update_state(&self) -> UpdateState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_update_state(&self, state: UpdateState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn check_for_update(&self) -> BoxFuture<'_, anyhow::Result<Option<UpdateFound>>> {
        async move { self.inner.check().await }.boxed()
    }

    fn start_update(&self, cancel: CancellationToken) -> mpsc::Receiver<DownloadProgress> {
        self.download_verify_and_execute(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevate::mock::MockPlatform;
    use crate::updater::authenticode::tests::FixedSigner;
    use crate::updater::fetch::tests::StaticFetcher;
    use crate::updater::installer::tests::{FailingInstaller, RecordingInstaller};
    use crate::updater::manifest::tests::{keypair, public_key_base64, sign};

    const MANIFEST_URL: &str = "https://updates.test/latest.sig";
    const ARTIFACT_BASE: &str = "https://updates.test/";
    const ARTIFACT_NAME: &str = "tunnel-manager-amd64-9.1.0.msi";

    struct Fixture {
        updater: Updater<MockPlatform>,
        installer: Arc<RecordingInstaller>,
        directory: PathBuf,
    }

    /// Accepts our own executable but no downloaded artifact.
    struct ArtifactRejectingSigner;

    impl CodeSigner for ArtifactRejectingSigner {
        fn verify(&self, _path: &Path, revocation: Revocation) -> anyhow::Result<()> {
            anyhow::ensure!(revocation == Revocation::None, "bad signature");
            Ok(())
        }
    }

    fn hash_of(data: &[u8]) -> String {
        hex::encode(Blake2b256::digest(data))
    }

    fn fixture(
        payload: &[u8],
        served: &[u8],
        running_version: &str,
        signer: Arc<dyn CodeSigner>,
    ) -> Fixture {
        let installer = Arc::new(RecordingInstaller::default());
        let (updater, directory) =
            build_updater(payload, served, running_version, signer, installer.clone());
        Fixture {
            updater,
            installer,
            directory,
        }
    }

    fn build_updater(
        payload: &[u8],
        served: &[u8],
        running_version: &str,
        signer: Arc<dyn CodeSigner>,
        installer: Arc<dyn Installer>,
    ) -> (Updater<MockPlatform>, PathBuf) {
        let pair = keypair();
        let manifest = format!(
            "{}  {}\n{}  tunnel-manager-arm64-9.1.0.msi\n",
            hash_of(payload),
            ARTIFACT_NAME,
            "00".repeat(32)
        );

        let fetcher = StaticFetcher::new();
        fetcher.serve(MANIFEST_URL, sign(&pair, &manifest));
        fetcher.serve(&format!("{}{}", ARTIFACT_BASE, ARTIFACT_NAME), served.to_vec());

        let directory =
            std::env::temp_dir().join(format!("tunnel_manager_test_{}", uuid::Uuid::new_v4()));
        let config = UpdaterConfig {
            manifest_url: MANIFEST_URL.to_string(),
            artifact_url_base: ARTIFACT_BASE.to_string(),
            public_key_base64: public_key_base64(&pair),
            update_directory: directory.join("updates"),
            running_version: running_version.to_string(),
            arch: "amd64".to_string(),
            artifact_prefix: "tunnel-manager-".to_string(),
            artifact_suffix: ".msi".to_string(),
            manifest_limit: 64 * 1024,
            download_limit: 1024,
        };
        let updater = Updater::new(
            config,
            Arc::new(fetcher),
            signer,
            installer,
            Arc::new(PrivilegeBroker::new(MockPlatform::already_system())),
            InstallIdentity::System,
            Handle::current(),
        );
        (updater, directory)
    }

    async fn collect(mut receiver: mpsc::Receiver<DownloadProgress>) -> Vec<DownloadProgress> {
        let mut items = Vec::new();
        while let Some(item) = receiver.recv().await {
            items.push(item);
        }
        items
    }

    fn activities(items: &[DownloadProgress]) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for item in items {
            if !item.activity.is_empty() && seen.last() != Some(&item.activity) {
                seen.push(item.activity.clone());
            }
        }
        seen
    }

    fn leftovers(fixture: &Fixture) -> Vec<String> {
        files_in(&fixture.directory)
    }

    fn files_in(directory: &Path) -> Vec<String> {
        std::fs::read_dir(directory.join("updates"))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_check_finds_newer_artifact() {
        let payload = b"installer package".to_vec();
        let fixture = fixture(&payload, &payload, "1.0.0", Arc::new(FixedSigner::accepting(true)));

        assert!(fixture.updater.is_official_build());
        let found = fixture.updater.check_for_update().await.unwrap().unwrap();
        assert_eq!(found.name, ARTIFACT_NAME);

        let current = fixture_with_version(&payload, "9.1.0");
        assert_eq!(current.updater.check_for_update().await.unwrap(), None);
    }

    fn fixture_with_version(payload: &[u8], version: &str) -> Fixture {
        fixture(payload, payload, version, Arc::new(FixedSigner::accepting(true)))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_installs_verified_artifact() {
        let payload = b"installer package contents".to_vec();
        let fixture = fixture_with_version(&payload, "1.0.0");

        let items = collect(fixture.updater.start_update(CancellationToken::new())).await;
        let last = items.last().unwrap();
        assert!(last.complete, "{:?}", last);
        assert_eq!(
            activities(&items),
            vec![
                "Initializing",
                "Rechecking for update",
                "Creating update file",
                "Downloading update",
                "Verifying update",
                "Installing update",
            ]
        );

        let downloaded = items
            .iter()
            .filter(|p| p.activity == "Downloading update")
            .map(|p| p.bytes_downloaded)
            .max()
            .unwrap();
        assert_eq!(downloaded, payload.len() as u64);

        let installed = fixture.installer.installed.lock().unwrap().clone();
        assert_eq!(installed.len(), 1);
        assert!(installed[0].0.ends_with(ARTIFACT_NAME));
        assert_eq!(installed[0].1, payload);
        assert!(leftovers(&fixture).is_empty());

        std::fs::remove_dir_all(&fixture.directory).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wrong_hash_is_not_installed() {
        let fixture = fixture(
            b"what the manifest promised",
            b"something else entirely",
            "1.0.0",
            Arc::new(FixedSigner::accepting(true)),
        );

        let items = collect(fixture.updater.start_update(CancellationToken::new())).await;
        let error = items.last().unwrap().error.clone().unwrap();
        assert!(error.contains("wrong hash"), "{}", error);
        assert!(fixture.installer.installed.lock().unwrap().is_empty());
        assert!(leftovers(&fixture).is_empty());

        std::fs::remove_dir_all(&fixture.directory).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unsigned_artifact_is_not_installed() {
        let payload = b"installer package".to_vec();
        let fixture = fixture(&payload, &payload, "1.0.0", Arc::new(ArtifactRejectingSigner));

        let items = collect(fixture.updater.start_update(CancellationToken::new())).await;
        let error = items.last().unwrap().error.clone().unwrap();
        assert!(error.contains("authentic"), "{}", error);
        assert!(fixture.installer.installed.lock().unwrap().is_empty());
        assert!(leftovers(&fixture).is_empty());

        std::fs::remove_dir_all(&fixture.directory).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_install_removes_artifact() {
        let payload = b"installer package".to_vec();
        let (updater, directory) = build_updater(
            &payload,
            &payload,
            "1.0.0",
            Arc::new(FixedSigner::accepting(true)),
            Arc::new(FailingInstaller),
        );

        let items = collect(updater.start_update(CancellationToken::new())).await;
        let error = items.last().unwrap().error.clone().unwrap();
        assert!(error.contains("Failed to install update"), "{}", error);
        assert!(error.contains("1603"), "{}", error);
        assert!(files_in(&directory).is_empty());

        std::fs::remove_dir_all(&directory).ok();
    }

    #[cfg(unix)]
    #[test]
    fn test_update_directory_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let directory =
            std::env::temp_dir().join(format!("tunnel_manager_test_{}", uuid::Uuid::new_v4()));
        let updates = directory.join("updates");
        std::fs::create_dir_all(&updates).unwrap();
        std::fs::write(updates.join("stale.msi"), b"old").unwrap();

        recreate_update_directory(&updates).unwrap();
        let mode = std::fs::metadata(&updates).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(std::fs::read_dir(&updates).unwrap().next().is_none());

        std::fs::remove_dir_all(&directory).ok();
    }

    #[cfg(windows)]
    #[test]
    fn test_update_directory_gets_explicit_acl() {
        use windows::Win32::Foundation::{HLOCAL, LocalFree};
        use windows::Win32::Security::Authorization::{
            ConvertSecurityDescriptorToStringSecurityDescriptorW, GetNamedSecurityInfoW,
            SDDL_REVISION_1, SE_FILE_OBJECT,
        };
        use windows::Win32::Security::{DACL_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR};
        use windows::core::{HSTRING, PWSTR};

        let directory =
            std::env::temp_dir().join(format!("tunnel_manager_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&directory).unwrap();
        let private = directory.join("private");
        // Owner assignment needs SYSTEM, so only the DACL is checked here.
        create_directory_with_sddl(&private, "D:PAI(A;;FA;;;SY)(A;;FR;;;BA)").unwrap();

        let sddl = unsafe {
            let mut descriptor = PSECURITY_DESCRIPTOR::default();
            let status = GetNamedSecurityInfoW(
                &HSTRING::from(private.as_os_str()),
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION,
                None,
                None,
                None,
                None,
                &mut descriptor,
            );
            assert!(status.is_ok());
            let mut text = PWSTR::null();
            ConvertSecurityDescriptorToStringSecurityDescriptorW(
                descriptor,
                SDDL_REVISION_1,
                DACL_SECURITY_INFORMATION,
                &mut text,
                None,
            )
            .unwrap();
            let sddl = text.to_string().unwrap();
            let _ = LocalFree(HLOCAL(text.0.cast()));
            let _ = LocalFree(HLOCAL(descriptor.0));
            sddl
        };
        assert!(sddl.starts_with("D:P"), "{}", sddl);
        assert!(sddl.contains("(A;;FA;;;SY)"), "{}", sddl);
        assert!(sddl.contains("(A;;FR;;;BA)"), "{}", sddl);
        assert!(!sddl.contains(";;;BU)"), "{}", sddl);

        std::fs::remove_dir_all(&directory).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_artifact_is_rejected() {
        let payload = vec![0x5a; 4096];
        let fixture = fixture_with_version(&payload, "1.0.0");

        let items = collect(fixture.updater.start_update(CancellationToken::new())).await;
        let error = items.last().unwrap().error.clone().unwrap();
        assert!(error.contains("larger than 1024"), "{}", error);
        assert!(leftovers(&fixture).is_empty());

        std::fs::remove_dir_all(&fixture.directory).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_update_found_on_recheck() {
        let payload = b"installer package".to_vec();
        let fixture = fixture_with_version(&payload, "10.0");

        let items = collect(fixture.updater.start_update(CancellationToken::new())).await;
        let error = items.last().unwrap().error.clone().unwrap();
        assert_eq!(error, UpdateError::NoUpdateFound.to_string());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_download_leaves_nothing() {
        let payload = b"installer package".to_vec();
        let fixture = fixture_with_version(&payload, "1.0.0");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let items = collect(fixture.updater.start_update(cancel)).await;
        assert_eq!(items.last().unwrap().error.as_deref(), Some("Update cancelled"));
        assert!(fixture.installer.installed.lock().unwrap().is_empty());
        assert!(leftovers(&fixture).is_empty());

        std::fs::remove_dir_all(&fixture.directory).ok();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_update_is_refused() {
        let payload = b"installer package".to_vec();
        let fixture = fixture_with_version(&payload, "1.0.0");
        fixture.updater.inner.in_progress.store(true, Ordering::SeqCst);

        let items = collect(fixture.updater.start_update(CancellationToken::new())).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].activity, "Initializing");
        assert_eq!(
            items[1].error.as_deref(),
            Some("An update is already in progress")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unofficial_build_disables_updates() {
        let payload = b"installer package".to_vec();
        let fixture = fixture(&payload, &payload, "1.0.0", Arc::new(FixedSigner::accepting(false)));
        assert!(!fixture.updater.is_official_build());
        assert_eq!(
            fixture.updater.update_state(),
            UpdateState::UpdatesDisabledUnofficialBuild
        );
    }

    #[test]
    fn test_artifact_names_cannot_escape_directory() {
        assert!(validate_artifact_name(ARTIFACT_NAME).is_ok());
        for name in ["", "..", "../evil.msi", "dir\\evil.msi", "C:evil.msi"] {
            assert!(validate_artifact_name(name).is_err(), "{}", name);
        }
    }
}
