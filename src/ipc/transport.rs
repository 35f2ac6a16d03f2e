//! Local byte-stream endpoints: unix domain sockets, or named pipes on
//! Windows.

use crate::errors;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

pub trait IpcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IpcStream for T {}

pub type BoxedStream = Box<dyn IpcStream>;

pub struct IpcListener {
    path: PathBuf,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(windows)]
    server: tokio::net::windows::named_pipe::NamedPipeServer,
    #[cfg(windows)]
    security: PipeSecurity,
}

#[cfg(unix)]
impl IpcListener {
    /// Binds `path`, replacing a stale socket left by a previous run. The
    /// socket is accessible to the owner and its group only.
    pub async fn bind(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        if path.exists() {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| errors::ipc::failed_to_remove_stale(&path.display().to_string()))?;
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| errors::ipc::failed_to_bind(&path.display().to_string()))?;
        }

        let listener = tokio::net::UnixListener::bind(path)
            .with_context(|| errors::ipc::failed_to_bind(&path.display().to_string()))?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            .await
            .with_context(|| errors::ipc::failed_to_bind(&path.display().to_string()))?;

        tracing::debug!("Listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    pub async fn accept(&mut self) -> anyhow::Result<BoxedStream> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .context(errors::ipc::FAILED_TO_ACCEPT)?;
        Ok(Box::new(stream))
    }
}

#[cfg(unix)]
impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Full access for SYSTEM and Administrators, nobody else, nothing inherited.
#[cfg(windows)]
pub const PIPE_SDDL: &str = "D:P(A;;GA;;;SY)(A;;GA;;;BA)";

/// Security attributes applied to every instance of the control pipe.
#[cfg(windows)]
struct PipeSecurity {
    descriptor: windows::Win32::Security::PSECURITY_DESCRIPTOR,
    attributes: windows::Win32::Security::SECURITY_ATTRIBUTES,
}

// The descriptor is a private LocalAlloc block that is never mutated.
#[cfg(windows)]
unsafe impl Send for PipeSecurity {}

#[cfg(windows)]
impl PipeSecurity {
    fn from_sddl(sddl: &str) -> anyhow::Result<Self> {
        use windows::Win32::Security::Authorization::{
            ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
        };
        use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
        use windows::core::HSTRING;

        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                &HSTRING::from(sddl),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )
        }
        .context("ConvertStringSecurityDescriptorToSecurityDescriptor")?;
        Ok(Self {
            descriptor,
            attributes: SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor.0,
                bInheritHandle: false.into(),
            },
        })
    }

    fn create(
        &mut self,
        options: &tokio::net::windows::named_pipe::ServerOptions,
        path: &Path,
    ) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeServer> {
        unsafe {
            options.create_with_security_attributes_raw(
                path,
                &mut self.attributes as *mut _ as *mut std::ffi::c_void,
            )
        }
    }
}

#[cfg(windows)]
impl Drop for PipeSecurity {
    fn drop(&mut self) {
        use windows::Win32::Foundation::{HLOCAL, LocalFree};
        unsafe {
            let _ = LocalFree(HLOCAL(self.descriptor.0));
        }
    }
}

#[cfg(windows)]
impl IpcListener {
    /// Creates the first instance of the pipe at `path`. Fails if another
    /// process already owns the name.
    pub async fn bind(path: &Path) -> anyhow::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let mut security = PipeSecurity::from_sddl(PIPE_SDDL)
            .with_context(|| errors::ipc::failed_to_bind(&path.display().to_string()))?;
        let server = security
            .create(ServerOptions::new().first_pipe_instance(true), path)
            .with_context(|| errors::ipc::failed_to_bind(&path.display().to_string()))?;
        tracing::debug!("Listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            server,
            security,
        })
    }

    /// Hands out the connected instance and creates the next one before
    /// returning, so there is always an instance to connect to.
    pub async fn accept(&mut self) -> anyhow::Result<BoxedStream> {
        use tokio::net::windows::named_pipe::ServerOptions;

        self.server
            .connect()
            .await
            .context(errors::ipc::FAILED_TO_ACCEPT)?;
        let next = self
            .security
            .create(&ServerOptions::new(), &self.path)
            .with_context(|| errors::ipc::failed_to_bind(&self.path.display().to_string()))?;
        let connected = std::mem::replace(&mut self.server, next);
        Ok(Box::new(connected))
    }
}

impl IpcListener {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
pub async fn connect(path: &Path) -> anyhow::Result<BoxedStream> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .with_context(|| errors::ipc::failed_to_connect(&path.display().to_string()))?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
pub async fn connect(path: &Path) -> anyhow::Result<BoxedStream> {
    use std::time::Duration;
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;

    loop {
        match ClientOptions::new().open(path) {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| errors::ipc::failed_to_connect(&path.display().to_string()));
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = std::env::temp_dir().join(format!("tunnel_manager_test_{}", uuid::Uuid::new_v4()));
        let path = dir.join("manager.sock");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let mut listener = IpcListener::bind(&path).await.unwrap();
        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = connect(&path).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        server.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}

#[cfg(all(test, windows))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn descriptor_to_sddl(security: &PipeSecurity) -> String {
        use windows::Win32::Foundation::{HLOCAL, LocalFree};
        use windows::Win32::Security::Authorization::{
            ConvertSecurityDescriptorToStringSecurityDescriptorW, SDDL_REVISION_1,
        };
        use windows::Win32::Security::DACL_SECURITY_INFORMATION;
        use windows::core::PWSTR;

        unsafe {
            let mut text = PWSTR::null();
            ConvertSecurityDescriptorToStringSecurityDescriptorW(
                security.descriptor,
                SDDL_REVISION_1,
                DACL_SECURITY_INFORMATION,
                &mut text,
                None,
            )
            .unwrap();
            let sddl = text.to_string().unwrap();
            let _ = LocalFree(HLOCAL(text.0.cast()));
            sddl
        }
    }

    #[test]
    fn test_pipe_admits_only_system_and_administrators() {
        let security = PipeSecurity::from_sddl(PIPE_SDDL).unwrap();
        let sddl = descriptor_to_sddl(&security);
        assert!(sddl.starts_with("D:P"), "{}", sddl);
        assert!(sddl.contains("(A;;GA;;;SY)"), "{}", sddl);
        assert!(sddl.contains("(A;;GA;;;BA)"), "{}", sddl);
        assert!(!sddl.contains(";;;WD)"), "{}", sddl);
        assert!(!sddl.contains(";;;BU)"), "{}", sddl);
    }

    #[tokio::test]
    async fn test_secured_pipe_serves_multiple_instances() {
        let path = std::path::PathBuf::from(format!(
            "\\\\.\\pipe\\tunnel_manager_test_{}",
            uuid::Uuid::new_v4()
        ));
        let mut listener = IpcListener::bind(&path).await.unwrap();
        assert!(IpcListener::bind(&path).await.is_err());

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let mut stream = listener.accept().await.unwrap();
                let mut buf = [0u8; 5];
                stream.read_exact(&mut buf).await.unwrap();
                stream.write_all(&buf).await.unwrap();
            }
        });

        for message in [b"first", b"again"] {
            let mut client = connect(&path).await.unwrap();
            client.write_all(message).await.unwrap();
            let mut echoed = [0u8; 5];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(&echoed, message);
        }
        server.await.unwrap();
    }
}
