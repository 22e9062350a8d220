//! XDG path resolution.
//!
//! `XDG_CONFIG_HOME` / `XDG_DATA_HOME` are honored explicitly (they may be
//! set after process start in tests), falling back to the platform dirs.

use std::path::PathBuf;

use crate::keys::PublicKey;

const APP_DIR: &str = "pearsync";

/// `$XDG_CONFIG_HOME/pearsync`, falling back to `~/.config/pearsync`.
pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join(APP_DIR);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join(APP_DIR)
}

/// `$XDG_DATA_HOME/pearsync`, falling back to `~/.local/share/pearsync`.
pub fn data_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join(APP_DIR);
        }
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join(APP_DIR)
}

/// The JSON config file holding workspace aliases.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// The daemon's Unix-domain socket.
pub fn socket_path() -> PathBuf {
    config_dir().join("daemon.sock")
}

/// Per-workspace block storage root, keyed by the first 16 hex characters
/// of the workspace key.
pub fn store_dir(workspace_key: &PublicKey) -> PathBuf {
    data_dir()
        .join("stores")
        .join(workspace_key.short_hex())
        .join("store")
}
