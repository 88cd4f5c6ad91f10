//! Filesystem locations shared by the daemon and its clients.
//!
//! The socket path must be identical for the daemon and every client build,
//! so both sides resolve it through [`socket_path`].

use std::ffi::OsString;
use std::path::PathBuf;

use crate::AppConfig;

/// File name of the control socket inside the runtime directory.
pub const SOCKET_FILE_NAME: &str = "perch.sock";

/// File name of the configuration file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "perch.toml";

/// Resolve the control socket path: explicit config value first, then
/// `$XDG_RUNTIME_DIR/perch.sock`, then the system temp directory.
pub fn socket_path(config: &AppConfig) -> PathBuf {
    match config.daemon.socket_path.as_deref() {
        Some(path) => PathBuf::from(path),
        None => default_socket_path(),
    }
}

/// The socket path used when the configuration does not set one.
pub fn default_socket_path() -> PathBuf {
    socket_path_in(std::env::var_os("XDG_RUNTIME_DIR"))
}

fn socket_path_in(runtime_dir: Option<OsString>) -> PathBuf {
    runtime_dir
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_FILE_NAME)
}

/// Default config file location: `$XDG_CONFIG_HOME/perch/perch.toml`, or
/// `~/.config/perch/perch.toml`, or `perch.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    config_path_in(std::env::var_os("XDG_CONFIG_HOME"), std::env::var_os("HOME"))
}

fn config_path_in(config_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    let dir = config_home
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            home.filter(|dir| !dir.is_empty())
                .map(|home| PathBuf::from(home).join(".config"))
        });

    match dir {
        Some(dir) => dir.join("perch").join(CONFIG_FILE_NAME),
        None => PathBuf::from(CONFIG_FILE_NAME),
    }
}
