//! The persisted manifest view.
//!
//! A redb database holding the fold of the linearized op prefix:
//!
//! - `manifest`: path → FileMeta (bincode), ordered by path.
//! - `writers`: writer key → version at admission.
//! - `applied`: position → (writer, seq) of the consumed block.
//! - `undo`: position → inverse record, so any prefix state can be
//!   restored when the linearizer rewinds.
//! - `meta`: `version` (state-mutating op count) and `applied_len`
//!   (consumed block count; malformed or rule-violating ops consume a
//!   position without advancing the version).
//!
//! The view state is a pure function of the applied prefix: for any n,
//! `undo_to(n)` followed by re-applying the suffix reproduces the state
//! of applying the whole sequence.

use std::path::Path;

use parking_lot::Mutex;
use pearsync_core::keys::PublicKey;
use pearsync_core::op::{FileMeta, Operation};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::writers::WriterSet;

const MANIFEST: TableDefinition<&str, &[u8]> = TableDefinition::new("manifest");
const WRITERS: TableDefinition<&[u8], u64> = TableDefinition::new("writers");
const APPLIED: TableDefinition<u64, &[u8]> = TableDefinition::new("applied");
const UNDO: TableDefinition<u64, &[u8]> = TableDefinition::new("undo");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_VERSION: &str = "version";
const META_APPLIED_LEN: &str = "applied_len";

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("redb database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ViewError>;

/// Reference to one consumed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRef {
    pub writer: PublicKey,
    pub seq: u64,
}

/// Inverse of one consumed block, keyed by applied position.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum UndoRecord {
    /// The op was malformed or violated a rule; nothing changed.
    Noop,
    Put { path: String, prev: Option<FileMeta> },
    Del { path: String, prev: FileMeta },
    AddWriter { writer: PublicKey },
    RemoveWriter { writer: PublicKey, admitted_at: u64 },
}

struct ViewState {
    version: u64,
    applied: Vec<AppliedRef>,
    writers: WriterSet,
}

/// The materialized key/value manifest for one workspace.
pub struct View {
    db: Database,
    state: Mutex<ViewState>,
}

impl View {
    /// Open (or create) the view database, restoring the cached state.
    pub fn open(path: &Path, bootstrap: PublicKey) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create tables and seed the bootstrap member on first open.
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(MANIFEST)?;
            let mut writers = txn.open_table(WRITERS)?;
            let _ = txn.open_table(APPLIED)?;
            let _ = txn.open_table(UNDO)?;
            let mut meta = txn.open_table(META)?;
            if meta.get(META_VERSION)?.is_none() {
                meta.insert(META_VERSION, 0)?;
                meta.insert(META_APPLIED_LEN, 0)?;
                writers.insert(bootstrap.as_bytes().as_slice(), 0)?;
            }
        }
        txn.commit()?;

        // Restore the in-memory mirror.
        let read = db.begin_read()?;
        let meta = read.open_table(META)?;
        let version = meta.get(META_VERSION)?.map(|g| g.value()).unwrap_or(0);
        let applied_len = meta.get(META_APPLIED_LEN)?.map(|g| g.value()).unwrap_or(0);

        let mut writers = WriterSet::new(bootstrap);
        let writers_table = read.open_table(WRITERS)?;
        for entry in writers_table.iter()? {
            let (key, admitted_at) = entry?;
            let bytes: [u8; 32] = key
                .value()
                .try_into()
                .map_err(|_| ViewError::Serialization(bincode::ErrorKind::Custom(
                    "corrupt writer key".into(),
                ).into()))?;
            writers.restore(PublicKey(bytes), admitted_at.value());
        }

        let mut applied = Vec::with_capacity(applied_len as usize);
        let applied_table = read.open_table(APPLIED)?;
        for entry in applied_table.iter()? {
            let (_, value) = entry?;
            applied.push(bincode::deserialize(value.value())?);
        }
        drop(read);

        tracing::debug!(version, applied_len, "view opened");
        Ok(Self {
            db,
            state: Mutex::new(ViewState {
                version,
                applied,
                writers,
            }),
        })
    }

    /// Version counter: one per state-mutating applied op.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Number of consumed blocks (the applied prefix length).
    pub fn applied_len(&self) -> u64 {
        self.state.lock().applied.len() as u64
    }

    /// The consumed block order so far.
    pub fn applied_refs(&self) -> Vec<AppliedRef> {
        self.state.lock().applied.clone()
    }

    /// Snapshot of the current writer set.
    pub fn writer_set(&self) -> WriterSet {
        self.state.lock().writers.clone()
    }

    pub fn is_writer(&self, key: &PublicKey) -> bool {
        self.state.lock().writers.is_member(key)
    }

    /// Point lookup.
    pub fn get(&self, path: &str) -> Result<Option<FileMeta>> {
        let read = self.db.begin_read()?;
        let manifest = read.open_table(MANIFEST)?;
        match manifest.get(path)? {
            Some(guard) => Ok(Some(bincode::deserialize(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Number of manifest entries, without reading their content.
    pub fn file_count(&self) -> Result<u64> {
        let read = self.db.begin_read()?;
        let manifest = read.open_table(MANIFEST)?;
        Ok(manifest.len()?)
    }

    /// Full scan, ordered by path.
    pub fn scan(&self) -> Result<Vec<(String, FileMeta)>> {
        let read = self.db.begin_read()?;
        let manifest = read.open_table(MANIFEST)?;
        let mut out = Vec::new();
        for entry in manifest.iter()? {
            let (path, value) = entry?;
            out.push((path.value().to_string(), bincode::deserialize(value.value())?));
        }
        Ok(out)
    }

    /// Apply the block `(author, seq, payload)` as the next position of
    /// the linearized order. Returns whether the view state changed.
    ///
    /// A payload that fails to decode, or an op violating a membership
    /// rule, consumes its position as a no-op — a log can never poison
    /// the view.
    pub fn apply(&self, author: PublicKey, seq: u64, payload: &[u8]) -> Result<bool> {
        let mut state = self.state.lock();
        let position = state.applied.len() as u64;
        let version = state.version;

        // Work out the effect against the in-memory mirror first.
        enum Effect {
            None,
            Put(String, FileMeta),
            Del(String),
            AddWriter(PublicKey),
            RemoveWriter(PublicKey),
        }

        let mut writers = state.writers.clone();
        let (effect, undo) = match Operation::decode(payload) {
            Err(_) => (Effect::None, UndoRecord::Noop),
            Ok(Operation::Put { path, meta }) => {
                if writers.is_member(&author) {
                    let prev = self.get(&path)?;
                    (
                        Effect::Put(path.clone(), meta),
                        UndoRecord::Put { path, prev },
                    )
                } else {
                    (Effect::None, UndoRecord::Noop)
                }
            }
            Ok(Operation::Del { path }) => {
                if writers.is_member(&author) {
                    match self.get(&path)? {
                        Some(prev) => (
                            Effect::Del(path.clone()),
                            UndoRecord::Del { path, prev },
                        ),
                        None => (Effect::None, UndoRecord::Noop),
                    }
                } else {
                    (Effect::None, UndoRecord::Noop)
                }
            }
            Ok(Operation::AddWriter { writer }) => {
                let writer = PublicKey(writer);
                if writers.apply_add(&author, writer, version) {
                    (Effect::AddWriter(writer), UndoRecord::AddWriter { writer })
                } else {
                    (Effect::None, UndoRecord::Noop)
                }
            }
            Ok(Operation::RemoveWriter { writer }) => {
                let writer = PublicKey(writer);
                match writers.apply_remove(&author, &writer) {
                    Some(admitted_at) => (
                        Effect::RemoveWriter(writer),
                        UndoRecord::RemoveWriter { writer, admitted_at },
                    ),
                    None => (Effect::None, UndoRecord::Noop),
                }
            }
        };
        let mutated = !matches!(effect, Effect::None);

        // Persist block consumption + effect in one transaction.
        let txn = self.db.begin_write()?;
        {
            let mut manifest = txn.open_table(MANIFEST)?;
            let mut writers_table = txn.open_table(WRITERS)?;
            let mut applied = txn.open_table(APPLIED)?;
            let mut undo_table = txn.open_table(UNDO)?;
            let mut meta = txn.open_table(META)?;

            match &effect {
                Effect::None => {}
                Effect::Put(path, value) => {
                    manifest.insert(path.as_str(), bincode::serialize(value)?.as_slice())?;
                }
                Effect::Del(path) => {
                    manifest.remove(path.as_str())?;
                }
                Effect::AddWriter(writer) => {
                    writers_table.insert(writer.as_bytes().as_slice(), version)?;
                }
                Effect::RemoveWriter(writer) => {
                    writers_table.remove(writer.as_bytes().as_slice())?;
                }
            }

            let applied_ref = AppliedRef { writer: author, seq };
            applied.insert(position, bincode::serialize(&applied_ref)?.as_slice())?;
            undo_table.insert(position, bincode::serialize(&undo)?.as_slice())?;
            meta.insert(META_APPLIED_LEN, position + 1)?;
            if mutated {
                meta.insert(META_VERSION, version + 1)?;
            }
        }
        txn.commit()?;

        // Mirror only after the transaction is durable.
        state.applied.push(AppliedRef { writer: author, seq });
        state.writers = writers;
        if mutated {
            state.version += 1;
        }
        Ok(mutated)
    }

    /// Rewind the view so exactly `target` blocks remain consumed.
    pub fn undo_to(&self, target: u64) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.applied.len() as u64;
        if target >= current {
            return Ok(());
        }
        tracing::debug!(from = current, to = target, "rewinding view");

        let mut version = state.version;
        let mut writers = state.writers.clone();

        let txn = self.db.begin_write()?;
        {
            let mut manifest = txn.open_table(MANIFEST)?;
            let mut writers_table = txn.open_table(WRITERS)?;
            let mut applied = txn.open_table(APPLIED)?;
            let mut undo_table = txn.open_table(UNDO)?;
            let mut meta = txn.open_table(META)?;

            for position in (target..current).rev() {
                let record: UndoRecord = match undo_table.remove(position)? {
                    Some(guard) => bincode::deserialize(guard.value())?,
                    None => UndoRecord::Noop,
                };
                applied.remove(position)?;

                match &record {
                    UndoRecord::Noop => {}
                    UndoRecord::Put { path, prev } => {
                        match prev {
                            Some(meta_value) => {
                                manifest.insert(
                                    path.as_str(),
                                    bincode::serialize(meta_value)?.as_slice(),
                                )?;
                            }
                            None => {
                                manifest.remove(path.as_str())?;
                            }
                        }
                        version -= 1;
                    }
                    UndoRecord::Del { path, prev } => {
                        manifest.insert(path.as_str(), bincode::serialize(prev)?.as_slice())?;
                        version -= 1;
                    }
                    UndoRecord::AddWriter { writer } => {
                        writers_table.remove(writer.as_bytes().as_slice())?;
                        writers.evict(writer);
                        version -= 1;
                    }
                    UndoRecord::RemoveWriter { writer, admitted_at } => {
                        writers_table.insert(writer.as_bytes().as_slice(), *admitted_at)?;
                        writers.restore(*writer, *admitted_at);
                        version -= 1;
                    }
                }
            }

            meta.insert(META_APPLIED_LEN, target)?;
            meta.insert(META_VERSION, version)?;
        }
        txn.commit()?;

        state.applied.truncate(target as usize);
        state.version = version;
        state.writers = writers;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pearsync_core::keys::Keypair;
    use tempfile::TempDir;

    fn put(path: &str, content: &[u8], author: PublicKey) -> Vec<u8> {
        Operation::Put {
            path: path.into(),
            meta: FileMeta::from_content(content.to_vec(), 1_000, 0o644, *author.as_bytes()),
        }
        .encode()
        .unwrap()
    }

    fn del(path: &str) -> Vec<u8> {
        Operation::Del { path: path.into() }.encode().unwrap()
    }

    fn open_view(dir: &TempDir, bootstrap: PublicKey) -> View {
        View::open(&dir.path().join("view.redb"), bootstrap).unwrap()
    }

    #[test]
    fn put_get_del_round_trip() {
        let dir = TempDir::new().unwrap();
        let boot = Keypair::generate().public();
        let view = open_view(&dir, boot);

        assert!(view.apply(boot, 0, &put("a.txt", b"alpha", boot)).unwrap());
        assert_eq!(view.version(), 1);
        assert_eq!(view.get("a.txt").unwrap().unwrap().content, b"alpha");

        assert!(view.apply(boot, 1, &del("a.txt")).unwrap());
        assert_eq!(view.version(), 2);
        assert!(view.get("a.txt").unwrap().is_none());

        // Deleting an absent path consumes a position without mutating.
        assert!(!view.apply(boot, 2, &del("a.txt")).unwrap());
        assert_eq!(view.version(), 2);
        assert_eq!(view.applied_len(), 3);
    }

    #[test]
    fn scan_is_path_ordered() {
        let dir = TempDir::new().unwrap();
        let boot = Keypair::generate().public();
        let view = open_view(&dir, boot);

        for (i, path) in ["b/z.txt", "a.txt", "b/a.txt"].iter().enumerate() {
            view.apply(boot, i as u64, &put(path, b"x", boot)).unwrap();
        }
        let paths: Vec<String> = view.scan().unwrap().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a.txt", "b/a.txt", "b/z.txt"]);
    }

    #[test]
    fn malformed_op_is_ignored() {
        let dir = TempDir::new().unwrap();
        let boot = Keypair::generate().public();
        let view = open_view(&dir, boot);

        assert!(!view.apply(boot, 0, &[0xff, 0xff, 0xff]).unwrap());
        assert_eq!(view.version(), 0);
        assert_eq!(view.applied_len(), 1);
    }

    #[test]
    fn nonmember_ops_are_ignored() {
        let dir = TempDir::new().unwrap();
        let boot = Keypair::generate().public();
        let stranger = Keypair::generate().public();
        let view = open_view(&dir, boot);

        assert!(!view.apply(stranger, 0, &put("x", b"x", stranger)).unwrap());
        assert!(view.get("x").unwrap().is_none());
    }

    #[test]
    fn membership_fold() {
        let dir = TempDir::new().unwrap();
        let boot = Keypair::generate().public();
        let alice = Keypair::generate().public();
        let view = open_view(&dir, boot);

        let add = Operation::AddWriter {
            writer: *alice.as_bytes(),
        }
        .encode()
        .unwrap();
        assert!(view.apply(boot, 0, &add).unwrap());
        assert!(view.is_writer(&alice));

        // Alice can write now.
        assert!(view.apply(alice, 0, &put("hers.txt", b"hi", alice)).unwrap());

        // Self-removal only.
        let remove = Operation::RemoveWriter {
            writer: *alice.as_bytes(),
        }
        .encode()
        .unwrap();
        assert!(!view.apply(boot, 1, &remove).unwrap());
        assert!(view.is_writer(&alice));
        assert!(view.apply(alice, 1, &remove).unwrap());
        assert!(!view.is_writer(&alice));

        // Her earlier put survives removal.
        assert!(view.get("hers.txt").unwrap().is_some());
    }

    #[test]
    fn undo_restores_prefix_state() {
        let dir = TempDir::new().unwrap();
        let boot = Keypair::generate().public();
        let view = open_view(&dir, boot);

        view.apply(boot, 0, &put("a", b"one", boot)).unwrap();
        view.apply(boot, 1, &put("a", b"two", boot)).unwrap();
        view.apply(boot, 2, &put("b", b"bee", boot)).unwrap();
        view.apply(boot, 3, &del("a")).unwrap();
        assert_eq!(view.version(), 4);

        view.undo_to(2).unwrap();
        assert_eq!(view.applied_len(), 2);
        assert_eq!(view.version(), 2);
        assert_eq!(view.get("a").unwrap().unwrap().content, b"two");
        assert!(view.get("b").unwrap().is_none());

        view.undo_to(0).unwrap();
        assert_eq!(view.version(), 0);
        assert!(view.get("a").unwrap().is_none());
    }

    #[test]
    fn fold_law_undo_then_replay_equals_straight_apply() {
        let boot = Keypair::generate().public();
        let alice = Keypair::generate().public();

        let ops: Vec<(PublicKey, u64, Vec<u8>)> = vec![
            (boot, 0, put("a", b"1", boot)),
            (
                boot,
                1,
                Operation::AddWriter {
                    writer: *alice.as_bytes(),
                }
                .encode()
                .unwrap(),
            ),
            (alice, 0, put("b", b"2", alice)),
            (boot, 2, del("a")),
            (alice, 1, put("a", b"3", alice)),
        ];

        let dir_straight = TempDir::new().unwrap();
        let straight = open_view(&dir_straight, boot);
        for (author, seq, payload) in &ops {
            straight.apply(*author, *seq, payload).unwrap();
        }

        let dir_replay = TempDir::new().unwrap();
        let replay = open_view(&dir_replay, boot);
        for (author, seq, payload) in &ops {
            replay.apply(*author, *seq, payload).unwrap();
        }
        replay.undo_to(2).unwrap();
        for (author, seq, payload) in &ops[2..] {
            replay.apply(*author, *seq, payload).unwrap();
        }

        assert_eq!(straight.version(), replay.version());
        assert_eq!(straight.scan().unwrap(), replay.scan().unwrap());
        assert_eq!(straight.applied_refs(), replay.applied_refs());
    }

    #[test]
    fn reopen_restores_state() {
        let dir = TempDir::new().unwrap();
        let boot = Keypair::generate().public();
        let alice = Keypair::generate().public();
        {
            let view = open_view(&dir, boot);
            view.apply(boot, 0, &put("kept.txt", b"kept", boot)).unwrap();
            let add = Operation::AddWriter {
                writer: *alice.as_bytes(),
            }
            .encode()
            .unwrap();
            view.apply(boot, 1, &add).unwrap();
        }
        let view = open_view(&dir, boot);
        assert_eq!(view.version(), 2);
        assert_eq!(view.applied_len(), 2);
        assert!(view.is_writer(&alice));
        assert_eq!(view.get("kept.txt").unwrap().unwrap().content, b"kept");
    }
}
