//! The on-disk JSON configuration file.
//!
//! `$XDG_CONFIG_HOME/pearsync/config.json` maps workspace aliases to their
//! key, local path and per-workspace flags. The file carries an integer
//! version; unknown versions are rejected rather than migrated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::KeyError;

/// Version this loader understands.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config version {0} (expected {CONFIG_VERSION})")]
    UnsupportedVersion(u32),
    #[error("workspace '{0}' already exists")]
    WorkspaceExists(String),
    #[error("path {path} is already synced by workspace '{1}'", path = .0.display())]
    PathInUse(PathBuf, String),
    #[error("unknown workspace '{0}'")]
    WorkspaceNotFound(String),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// One configured workspace alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    /// Workspace key, 64 lowercase hex characters.
    pub key: String,
    /// Absolute path of the synced directory.
    pub path: PathBuf,
    /// Whether this machine created the workspace (bootstrap writer).
    pub is_writer: bool,
    /// Creation time, milliseconds since the Unix epoch.
    pub created: u64,
    /// Whether deletions propagate to local disk on pull.
    pub sync_deletes: bool,
}

/// Defaults applied to newly added workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    pub sync_deletes: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self { sync_deletes: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub workspaces: BTreeMap<String, WorkspaceEntry>,
    #[serde(default)]
    pub defaults: Defaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            workspaces: BTreeMap::new(),
            defaults: Defaults::default(),
        }
    }
}

impl Config {
    /// Load from `path`. A missing file yields the default (empty) config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Config = serde_json::from_str(&text)?;
        if config.version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(config.version));
        }
        Ok(config)
    }

    /// Write to `path`, creating parent directories as needed.
    ///
    /// Written via a temp file + rename so a crash mid-save never leaves a
    /// half-written config.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Register a workspace alias; rejects duplicate names and paths.
    pub fn add_workspace(&mut self, name: &str, entry: WorkspaceEntry) -> Result<(), ConfigError> {
        if self.workspaces.contains_key(name) {
            return Err(ConfigError::WorkspaceExists(name.to_string()));
        }
        if let Some((other, _)) = self.workspaces.iter().find(|(_, e)| e.path == entry.path) {
            return Err(ConfigError::PathInUse(entry.path.clone(), other.clone()));
        }
        self.workspaces.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn get_workspace(&self, name: &str) -> Result<&WorkspaceEntry, ConfigError> {
        self.workspaces
            .get(name)
            .ok_or_else(|| ConfigError::WorkspaceNotFound(name.to_string()))
    }

    pub fn remove_workspace(&mut self, name: &str) -> Result<WorkspaceEntry, ConfigError> {
        self.workspaces
            .remove(name)
            .ok_or_else(|| ConfigError::WorkspaceNotFound(name.to_string()))
    }

    /// Find the alias watching `path`, if any.
    pub fn workspace_for_path(&self, path: &Path) -> Option<(&String, &WorkspaceEntry)> {
        self.workspaces.iter().find(|(_, e)| e.path == path)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> WorkspaceEntry {
        WorkspaceEntry {
            key: "ab".repeat(32),
            path: PathBuf::from(path),
            is_writer: true,
            created: 1_700_000_000_000,
            sync_deletes: true,
        }
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.workspaces.is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.add_workspace("docs", entry("/home/me/docs")).unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.workspaces.len(), 1);
        assert_eq!(loaded.get_workspace("docs").unwrap(), &entry("/home/me/docs"));
    }

    #[test]
    fn unknown_version_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"version": 99, "workspaces": {}}"#).unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn duplicate_name_and_path_rejected() {
        let mut config = Config::default();
        config.add_workspace("a", entry("/p1")).unwrap();

        assert!(matches!(
            config.add_workspace("a", entry("/p2")),
            Err(ConfigError::WorkspaceExists(_))
        ));
        assert!(matches!(
            config.add_workspace("b", entry("/p1")),
            Err(ConfigError::PathInUse(..))
        ));
    }

    #[test]
    fn lookup_unknown_name() {
        let config = Config::default();
        assert!(matches!(
            config.get_workspace("nope"),
            Err(ConfigError::WorkspaceNotFound(_))
        ));
    }
}
