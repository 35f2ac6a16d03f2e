use crate::conf::name::{NameError, TunnelName};
use crate::constants::{PIPE_NAMESPACE, SERVICE_NAME_PREFIX};
use std::path::{Path, PathBuf};

pub fn service_name_of_tunnel(tunnel_name: &str) -> Result<String, NameError> {
    let name = TunnelName::new(tunnel_name)?;
    Ok(format!("{}{}", SERVICE_NAME_PREFIX, name))
}

pub fn pipe_path_of_tunnel(tunnel_name: &str) -> Result<PathBuf, NameError> {
    let name = TunnelName::new(tunnel_name)?;
    Ok(pipe_path_in(Path::new(PIPE_NAMESPACE), &name))
}

/// Same layout as [`pipe_path_of_tunnel`], rooted somewhere other than the
/// administrator namespace.
pub fn pipe_path_in(directory: &Path, name: &TunnelName) -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(format!("{}{}", directory.display(), name))
    }
    #[cfg(not(windows))]
    {
        directory.join(name.as_str())
    }
}

/// Reverse of [`service_name_of_tunnel`].
pub fn tunnel_of_service_name(service_name: &str) -> Option<TunnelName> {
    service_name
        .strip_prefix(SERVICE_NAME_PREFIX)
        .and_then(|name| TunnelName::new(name).ok())
}
