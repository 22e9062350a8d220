//! The engine-local sync index.
//!
//! Records, per path, the content hash this engine last wrote to or read
//! from disk as part of a sync. It is what lets `push` tell a genuinely
//! new local file apart from the on-disk leftover of a remote deletion:
//! a view-absent file whose disk hash still matches the index was synced
//! before and then deleted remotely, so pushing it would resurrect it.
//! A file that differs from the index is a real local change and wins
//! over a concurrent remote delete.
//!
//! Strictly node-local state — never replicated, safe to lose (the cost
//! of losing it is a spurious re-upload, not data loss). Persisted as a
//! bincode map next to the block store, written via temp file + rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::Result;

const INDEX_FILE: &str = "sync_index.bin";

pub struct SyncIndex {
    path: PathBuf,
    map: Mutex<HashMap<String, [u8; 32]>>,
}

impl SyncIndex {
    /// Load the index from `store_dir`, starting empty if absent or
    /// unreadable.
    pub fn load(store_dir: &Path) -> Self {
        let path = store_dir.join(INDEX_FILE);
        let map = std::fs::read(&path)
            .ok()
            .and_then(|bytes| bincode::deserialize(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    /// Hash last synced for `path`, if any.
    pub fn get(&self, path: &str) -> Option<[u8; 32]> {
        self.map.lock().get(path).copied()
    }

    pub fn record(&self, path: &str, hash: [u8; 32]) {
        self.map.lock().insert(path.to_string(), hash);
    }

    pub fn forget(&self, path: &str) {
        self.map.lock().remove(path);
    }

    /// Persist the current map atomically.
    pub fn save(&self) -> Result<()> {
        let bytes = bincode::serialize(&*self.map.lock())
            .map_err(|e| crate::EngineError::Fatal(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_get_forget() {
        let dir = TempDir::new().unwrap();
        let index = SyncIndex::load(dir.path());
        assert!(index.get("a.txt").is_none());

        index.record("a.txt", [7; 32]);
        assert_eq!(index.get("a.txt"), Some([7; 32]));

        index.forget("a.txt");
        assert!(index.get("a.txt").is_none());
    }

    #[test]
    fn survives_save_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let index = SyncIndex::load(dir.path());
            index.record("x", [1; 32]);
            index.record("y", [2; 32]);
            index.save().unwrap();
        }
        let index = SyncIndex::load(dir.path());
        assert_eq!(index.get("x"), Some([1; 32]));
        assert_eq!(index.get("y"), Some([2; 32]));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), b"garbage").unwrap();
        let index = SyncIndex::load(dir.path());
        assert!(index.get("anything").is_none());
    }
}
