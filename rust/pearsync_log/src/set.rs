//! Log Set — every writer log of one workspace.
//!
//! Holds at most one [`BlockStore`] per writer key in the process. The
//! bootstrap log is opened at workspace-open time; other logs are created
//! on demand, either when an `add-writer` op is applied or when a peer
//! starts replicating a log we have never seen.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use pearsync_core::keys::{Keypair, PublicKey};
use tokio::sync::watch;

use crate::store::{BlockStore, DEFAULT_SEGMENT_SIZE};
use crate::Result;

/// File under the store root holding the local writer's secret seed.
const WRITER_KEY_FILE: &str = "writer.key";

/// All logs of one workspace, keyed by writer public key.
pub struct LogSet {
    root: PathBuf,
    workspace_key: PublicKey,
    local_key: PublicKey,
    stores: DashMap<PublicKey, Arc<BlockStore>>,
    segment_size: u64,
    known_tx: watch::Sender<u64>,
}

impl LogSet {
    /// Open the log set rooted at `root`.
    ///
    /// The local writer's log opens writable with `keypair`; the bootstrap
    /// log (whose key is the workspace key) opens read-only unless this
    /// process *is* the bootstrap writer.
    pub fn open(root: &Path, workspace_key: PublicKey, keypair: Keypair) -> Result<Self> {
        Self::open_with_segment_size(root, workspace_key, keypair, DEFAULT_SEGMENT_SIZE)
    }

    pub fn open_with_segment_size(
        root: &Path,
        workspace_key: PublicKey,
        keypair: Keypair,
        segment_size: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let local_key = keypair.public();

        let (known_tx, _) = watch::channel(0);
        let set = Self {
            root: root.to_path_buf(),
            workspace_key,
            local_key,
            stores: DashMap::new(),
            segment_size,
            known_tx,
        };

        let local = Arc::new(BlockStore::open(
            &set.log_dir(&local_key),
            local_key,
            Some(keypair),
            segment_size,
        )?);
        set.stores.insert(local_key, local);

        if local_key != workspace_key {
            set.get_or_open(workspace_key)?;
        }
        Ok(set)
    }

    /// Persist a specific writer seed under `root`, so a keypair created
    /// before the store directory existed (workspace creation: the key
    /// determines the directory name) is the identity every later open
    /// loads.
    pub fn persist_keypair(root: &Path, keypair: &Keypair) -> Result<()> {
        std::fs::create_dir_all(root)?;
        std::fs::write(root.join(WRITER_KEY_FILE), keypair.seed())?;
        Ok(())
    }

    /// Load the writer seed from `root`, generating and persisting a fresh
    /// one on first open. The same directory always yields the same
    /// writer identity.
    pub fn load_or_generate_keypair(root: &Path) -> Result<Keypair> {
        std::fs::create_dir_all(root)?;
        let path = root.join(WRITER_KEY_FILE);
        match std::fs::read(&path) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                Ok(Keypair::from_seed(&seed))
            }
            Ok(_) | Err(_) => {
                let keypair = Keypair::generate();
                std::fs::write(&path, keypair.seed())?;
                tracing::info!(key = %keypair.public(), "generated writer identity");
                Ok(keypair)
            }
        }
    }

    pub fn workspace_key(&self) -> PublicKey {
        self.workspace_key
    }

    pub fn local_key(&self) -> PublicKey {
        self.local_key
    }

    /// The local writer's own (writable) log.
    pub fn local(&self) -> Arc<BlockStore> {
        self.stores
            .get(&self.local_key)
            .map(|e| e.value().clone())
            .expect("local log always present")
    }

    /// The bootstrap writer's log.
    pub fn bootstrap(&self) -> Arc<BlockStore> {
        self.stores
            .get(&self.workspace_key)
            .map(|e| e.value().clone())
            .expect("bootstrap log always present")
    }

    /// Fetch a log, opening its store on first sight of the key.
    pub fn get_or_open(&self, key: PublicKey) -> Result<Arc<BlockStore>> {
        if let Some(existing) = self.stores.get(&key) {
            return Ok(existing.value().clone());
        }
        // Entry API keeps the at-most-one-store-per-key invariant under
        // concurrent discovery of the same writer.
        let entry = self.stores.entry(key);
        match entry {
            dashmap::mapref::entry::Entry::Occupied(o) => Ok(o.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let store = Arc::new(BlockStore::open(
                    &self.log_dir(&key),
                    key,
                    None,
                    self.segment_size,
                )?);
                tracing::debug!(key = %key, "opened log for newly known writer");
                v.insert(store.clone());
                self.known_tx.send_modify(|n| *n += 1);
                Ok(store)
            }
        }
    }

    /// Whether a store for `key` already exists in this process.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.stores.contains_key(key)
    }

    /// Watch bumped whenever a log for a new writer key is opened;
    /// replication tasks use it to start sessions for late-discovered
    /// logs on already-open connections.
    pub fn watch_known(&self) -> watch::Receiver<u64> {
        self.known_tx.subscribe()
    }

    /// Snapshot of all known logs.
    pub fn known(&self) -> Vec<(PublicKey, Arc<BlockStore>)> {
        let mut logs: Vec<_> = self
            .stores
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        logs.sort_by_key(|(k, _)| *k);
        logs
    }

    /// Close every store. Idempotent.
    pub fn close(&self) -> Result<()> {
        for entry in self.stores.iter() {
            entry.value().close()?;
        }
        Ok(())
    }

    fn log_dir(&self, key: &PublicKey) -> PathBuf {
        self.root.join("logs").join(key.to_hex())
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
    fn bootstrap_writer_has_one_writable_log() {
        let dir = TempDir::new().unwrap();
        let keypair = LogSet::load_or_generate_keypair(dir.path()).unwrap();
        let ws = keypair.public();
        let set = LogSet::open(dir.path(), ws, keypair).unwrap();

        assert_eq!(set.local_key(), ws);
        assert!(set.local().is_writable());
        assert_eq!(set.known().len(), 1);
        assert!(Arc::ptr_eq(&set.local(), &set.bootstrap()));
    }

    #[test]
    fn joiner_has_local_and_bootstrap_logs() {
        let dir = TempDir::new().unwrap();
        let ws = Keypair::generate().public();
        let keypair = LogSet::load_or_generate_keypair(dir.path()).unwrap();
        let set = LogSet::open(dir.path(), ws, keypair).unwrap();

        assert_ne!(set.local_key(), ws);
        assert!(set.local().is_writable());
        assert!(!set.bootstrap().is_writable());
        assert_eq!(set.known().len(), 2);
    }

    #[test]
    fn writer_identity_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let first = LogSet::load_or_generate_keypair(dir.path()).unwrap();
        let second = LogSet::load_or_generate_keypair(dir.path()).unwrap();
        assert_eq!(first.public(), second.public());
    }

    #[test]
    fn get_or_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let keypair = LogSet::load_or_generate_keypair(dir.path()).unwrap();
        let ws = keypair.public();
        let set = LogSet::open(dir.path(), ws, keypair).unwrap();

        let other = Keypair::generate().public();
        let a = set.get_or_open(other).unwrap();
        let b = set.get_or_open(other).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(set.known().len(), 2);
        assert!(set.contains(&other));
    }

    #[test]
    fn known_is_sorted_by_key() {
        let dir = TempDir::new().unwrap();
        let keypair = LogSet::load_or_generate_keypair(dir.path()).unwrap();
        let ws = keypair.public();
        let set = LogSet::open(dir.path(), ws, keypair).unwrap();
        for _ in 0..4 {
            set.get_or_open(Keypair::generate().public()).unwrap();
        }
        let keys: Vec<_> = set.known().into_iter().map(|(k, _)| k).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
