//! Code signature checks for update artifacts and for our own executable.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    None,
    WholeChain,
}

pub trait CodeSigner: Send + Sync + 'static {
    fn verify(&self, path: &Path, revocation: Revocation) -> anyhow::Result<()>;
}

/// A build is official when its own executable carries a valid signature.
pub fn running_build_is_official(signer: &dyn CodeSigner) -> bool {
    let executable = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!("Unable to determine executable path: {}", e);
            return false;
        }
    };
    match signer.verify(&executable, Revocation::None) {
        Ok(()) => true,
        Err(e) => {
            tracing::info!("Running build is unofficial: {:#}", e);
            false
        }
    }
}

#[cfg(windows)]
pub use self::wintrust::WinTrustSigner as NativeCodeSigner;
#[cfg(not(windows))]
pub use self::UnsupportedSigner as NativeCodeSigner;

pub fn native_code_signer() -> NativeCodeSigner {
    NativeCodeSigner::default()
}

/// Never verifies anything, so builds on this platform are unofficial.
#[derive(Debug, Default)]
pub struct UnsupportedSigner;

impl CodeSigner for UnsupportedSigner {
    fn verify(&self, path: &Path, _revocation: Revocation) -> anyhow::Result<()> {
        anyhow::bail!(
            "Code signature verification is not supported on this platform: {}",
            path.display()
        )
    }
}

#[cfg(windows)]
mod wintrust {
    use super::{CodeSigner, Revocation};
    use anyhow::Context;
    use std::path::Path;
    use windows::Win32::Foundation::HWND;
    use windows::Win32::Security::WinTrust::{
        WINTRUST_ACTION_GENERIC_VERIFY_V2, WINTRUST_DATA, WINTRUST_DATA_0,
        WINTRUST_DATA_REVOCATION_CHECKS, WINTRUST_FILE_INFO, WTD_CHOICE_FILE,
        WTD_REVOKE_NONE, WTD_REVOKE_WHOLECHAIN, WTD_STATEACTION_CLOSE, WTD_STATEACTION_VERIFY,
        WTD_UI_NONE, WinVerifyTrust,
    };
    use windows::core::{HSTRING, PCWSTR};

    #[derive(Debug, Default)]
    pub struct WinTrustSigner;

    impl CodeSigner for WinTrustSigner {
        fn verify(&self, path: &Path, revocation: Revocation) -> anyhow::Result<()> {
            let wide = HSTRING::from(path.as_os_str());
            let mut file = WINTRUST_FILE_INFO {
                cbStruct: std::mem::size_of::<WINTRUST_FILE_INFO>() as u32,
                pcwszFilePath: PCWSTR(wide.as_ptr()),
                ..Default::default()
            };
            let revoke: WINTRUST_DATA_REVOCATION_CHECKS = match revocation {
                Revocation::None => WTD_REVOKE_NONE,
                Revocation::WholeChain => WTD_REVOKE_WHOLECHAIN,
            };
            let mut data = WINTRUST_DATA {
                cbStruct: std::mem::size_of::<WINTRUST_DATA>() as u32,
                dwUIChoice: WTD_UI_NONE,
                fdwRevocationChecks: revoke,
                dwUnionChoice: WTD_CHOICE_FILE,
                Anonymous: WINTRUST_DATA_0 { pFile: &mut file },
                dwStateAction: WTD_STATEACTION_VERIFY,
                ..Default::default()
            };
            let mut action = WINTRUST_ACTION_GENERIC_VERIFY_V2;

            let status = unsafe {
                WinVerifyTrust(
                    HWND(std::ptr::null_mut()),
                    &mut action,
                    (&mut data as *mut WINTRUST_DATA).cast(),
                )
            };
            data.dwStateAction = WTD_STATEACTION_CLOSE;
            unsafe {
                let _ = WinVerifyTrust(
                    HWND(std::ptr::null_mut()),
                    &mut action,
                    (&mut data as *mut WINTRUST_DATA).cast(),
                );
            }

            if status != 0 {
                return Err(windows::core::Error::from(windows::core::HRESULT(status)))
                    .with_context(|| format!("WinVerifyTrust failed for {}", path.display()));
            }
            Ok(())
        }
    }
}
