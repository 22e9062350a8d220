//! Deterministic linearization of the writer logs.
//!
//! The total order is a greedy merge over the locally available block
//! set: starting from the bootstrap writer, repeatedly consume — among
//! every admitted writer's next unconsumed block — the minimum by
//! `(seq, writer key)`. Applying `add-writer` admits that writer's log
//! into the merge from seq 0; a valid self-authored `remove-writer` stops
//! further consumption from that log.
//!
//! Two peers holding the same blocks therefore compute the same order,
//! regardless of arrival interleaving. When a late block sorts before an
//! already-applied position (a newly admitted writer's history, say), the
//! merge target diverges from the applied prefix; the view is rewound to
//! the longest common prefix and the suffix replayed. The same rewind
//! path doubles as recovery after restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use pearsync_core::keys::PublicKey;
use pearsync_core::op::Operation;
use pearsync_log::LogSet;

use crate::view::{AppliedRef, View};
use crate::writers::WriterSet;
use crate::Result;

#[derive(Debug, Clone, Copy)]
enum MembershipOp {
    Add(PublicKey),
    Remove(PublicKey),
}

/// What one update pass did.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOutcome {
    /// Blocks newly consumed into the view this pass.
    pub consumed: u64,
    /// Whether the applied prefix had to be rewound first.
    pub rewound: bool,
    /// View version after the pass.
    pub version: u64,
}

/// Merges all admitted writer logs into the view.
pub struct Linearizer {
    logs: Arc<LogSet>,
    view: Arc<View>,
    /// Blocks are immutable, so each block's membership effect (usually
    /// none) is decoded at most once.
    membership_cache: Mutex<HashMap<(PublicKey, u64), Option<MembershipOp>>>,
    update_lock: tokio::sync::Mutex<()>,
}

impl Linearizer {
    pub fn new(logs: Arc<LogSet>, view: Arc<View>) -> Self {
        Self {
            logs,
            view,
            membership_cache: Mutex::new(HashMap::new()),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// One update pass: recompute the merge target over the currently
    /// available blocks, rewind the view if the applied prefix diverged,
    /// and apply everything new. Apply is synchronous with respect to
    /// this call; passes are serialized.
    pub async fn update(&self) -> Result<UpdateOutcome> {
        let _guard = self.update_lock.lock().await;

        let target = self.merge_target()?;
        let applied = self.view.applied_refs();

        let common = applied
            .iter()
            .zip(target.iter())
            .take_while(|(a, t)| a == t)
            .count() as u64;

        let rewound = common < applied.len() as u64;
        if rewound {
            self.view.undo_to(common)?;
        }

        let mut consumed = 0u64;
        for item in &target[common as usize..] {
            let store = self.logs.get_or_open(item.writer)?;
            let Some(block) = store.get_local(item.seq)? else {
                // The block vanished between snapshot and apply; the next
                // pass recomputes from whatever is really there.
                break;
            };
            self.view.apply(item.writer, item.seq, &block.payload)?;
            consumed += 1;
        }

        if consumed > 0 || rewound {
            tracing::debug!(
                consumed,
                rewound,
                version = self.view.version(),
                "linearizer pass"
            );
        }
        Ok(UpdateOutcome {
            consumed,
            rewound,
            version: self.view.version(),
        })
    }

    /// Compute the merge order over every block currently available.
    fn merge_target(&self) -> Result<Vec<AppliedRef>> {
        let bootstrap = self.logs.workspace_key();
        let mut writers = WriterSet::new(bootstrap);
        let mut cursors: BTreeMap<PublicKey, u64> = BTreeMap::new();
        let mut lengths: BTreeMap<PublicKey, u64> = BTreeMap::new();
        lengths.insert(bootstrap, self.logs.bootstrap().length());

        let mut target = Vec::new();
        loop {
            let next = writers
                .members()
                .filter_map(|(member, _)| {
                    let cursor = cursors.get(member).copied().unwrap_or(0);
                    let length = lengths.get(member).copied().unwrap_or(0);
                    (cursor < length).then_some((cursor, *member))
                })
                .min();
            let Some((seq, writer)) = next else {
                break;
            };

            target.push(AppliedRef { writer, seq });
            cursors.insert(writer, seq + 1);

            match self.membership_op(writer, seq)? {
                Some(MembershipOp::Add(key)) => {
                    if writers.apply_add(&writer, key, target.len() as u64) {
                        let store = self.logs.get_or_open(key)?;
                        lengths.insert(key, store.length());
                    }
                }
                Some(MembershipOp::Remove(key)) => {
                    writers.apply_remove(&writer, &key);
                }
                None => {}
            }
        }
        Ok(target)
    }

    fn membership_op(&self, writer: PublicKey, seq: u64) -> Result<Option<MembershipOp>> {
        if let Some(cached) = self.membership_cache.lock().get(&(writer, seq)) {
            return Ok(*cached);
        }
        let store = self.logs.get_or_open(writer)?;
        let effect = match store.get_local(seq)? {
            Some(block) => match Operation::decode(&block.payload) {
                Ok(Operation::AddWriter { writer }) => {
                    Some(MembershipOp::Add(PublicKey(writer)))
                }
                Ok(Operation::RemoveWriter { writer }) => {
                    Some(MembershipOp::Remove(PublicKey(writer)))
                }
                _ => None,
            },
            None => return Ok(None), // not cached: the block may still arrive
        };
        self.membership_cache.lock().insert((writer, seq), effect);
        Ok(effect)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pearsync_core::keys::Keypair;
    use pearsync_core::op::FileMeta;
    use pearsync_log::block::Block;
    use pearsync_log::store::DEFAULT_SEGMENT_SIZE;
    use pearsync_log::BlockStore;
    use tempfile::TempDir;

    struct Peer {
        _dir: TempDir,
        logs: Arc<LogSet>,
        view: Arc<View>,
        linearizer: Linearizer,
    }

    fn peer(workspace: PublicKey) -> Peer {
        let dir = TempDir::new().unwrap();
        let keypair = LogSet::load_or_generate_keypair(dir.path()).unwrap();
        let logs = Arc::new(LogSet::open(dir.path(), workspace, keypair).unwrap());
        let view = Arc::new(View::open(&dir.path().join("view.redb"), workspace).unwrap());
        let linearizer = Linearizer::new(logs.clone(), view.clone());
        Peer {
            _dir: dir,
            logs,
            view,
            linearizer,
        }
    }

    /// A writable source log living outside any peer, used to author
    /// blocks that tests then deliver in arbitrary orders.
    struct Source {
        _dir: TempDir,
        keypair_public: PublicKey,
        store: BlockStore,
    }

    fn source() -> Source {
        let dir = TempDir::new().unwrap();
        let kp = Keypair::generate();
        let public = kp.public();
        let store = BlockStore::open(dir.path(), public, Some(kp), DEFAULT_SEGMENT_SIZE).unwrap();
        Source {
            _dir: dir,
            keypair_public: public,
            store,
        }
    }

    fn put(path: &str, content: &[u8], author: PublicKey) -> Vec<u8> {
        Operation::Put {
            path: path.into(),
            meta: FileMeta::from_content(content.to_vec(), 1_000, 0o644, *author.as_bytes()),
        }
        .encode()
        .unwrap()
    }

    fn add_writer(key: PublicKey) -> Vec<u8> {
        Operation::AddWriter {
            writer: *key.as_bytes(),
        }
        .encode()
        .unwrap()
    }

    fn blocks_of(src: &Source) -> Vec<Block> {
        (0..src.store.length())
            .map(|seq| src.store.get_local(seq).unwrap().unwrap())
            .collect()
    }

    fn deliver(peer: &Peer, writer: PublicKey, block: Block) {
        peer.logs
            .get_or_open(writer)
            .unwrap()
            .insert_remote(block)
            .unwrap();
    }

    #[tokio::test]
    async fn single_writer_applies_in_log_order() {
        let boot = source();
        boot.store.append(&put("a", b"1", boot.keypair_public)).unwrap();
        boot.store.append(&put("b", b"2", boot.keypair_public)).unwrap();

        let p = peer(boot.keypair_public);
        for block in blocks_of(&boot) {
            deliver(&p, boot.keypair_public, block);
        }

        let outcome = p.linearizer.update().await.unwrap();
        assert_eq!(outcome.consumed, 2);
        assert!(!outcome.rewound);
        assert_eq!(p.view.get("a").unwrap().unwrap().content, b"1");
        assert_eq!(p.view.get("b").unwrap().unwrap().content, b"2");

        // Idempotent: nothing new, nothing consumed.
        let outcome = p.linearizer.update().await.unwrap();
        assert_eq!(outcome.consumed, 0);
    }

    #[tokio::test]
    async fn late_writer_history_triggers_rewind() {
        let boot = source();
        let alice = source();

        boot.store.append(&put("boot0", b"b0", boot.keypair_public)).unwrap();
        boot.store.append(&add_writer(alice.keypair_public)).unwrap();
        boot.store.append(&put("boot2", b"b2", boot.keypair_public)).unwrap();
        alice.store.append(&put("alice0", b"a0", alice.keypair_public)).unwrap();

        let p = peer(boot.keypair_public);

        // Bootstrap log arrives first and is applied in full.
        for block in blocks_of(&boot) {
            deliver(&p, boot.keypair_public, block);
        }
        let first = p.linearizer.update().await.unwrap();
        assert_eq!(first.consumed, 3);

        // Alice's seq-0 block sorts before boot's seq-2 block, so its
        // arrival rewinds and replays.
        for block in blocks_of(&alice) {
            deliver(&p, alice.keypair_public, block);
        }
        let second = p.linearizer.update().await.unwrap();
        assert!(second.rewound);
        assert!(p.view.get("alice0").unwrap().is_some());

        let order = p.view.applied_refs();
        let alice_pos = order
            .iter()
            .position(|r| r.writer == alice.keypair_public)
            .unwrap();
        let boot2_pos = order.iter().position(|r| r.seq == 2).unwrap();
        assert!(alice_pos < boot2_pos, "alice's history must sort first");
    }

    #[tokio::test]
    async fn determinism_under_permuted_arrival() {
        let boot = source();
        let alice = source();

        boot.store.append(&put("shared", b"from-boot", boot.keypair_public)).unwrap();
        boot.store.append(&add_writer(alice.keypair_public)).unwrap();
        boot.store.append(&put("boot-late", b"bl", boot.keypair_public)).unwrap();
        alice.store.append(&put("shared", b"from-alice", alice.keypair_public)).unwrap();
        alice.store.append(&put("alice-late", b"al", alice.keypair_public)).unwrap();

        let p1 = peer(boot.keypair_public);
        let p2 = peer(boot.keypair_public);

        // P1: bootstrap log fully, update, then alice's log.
        for block in blocks_of(&boot) {
            deliver(&p1, boot.keypair_public, block);
        }
        p1.linearizer.update().await.unwrap();
        for block in blocks_of(&alice) {
            deliver(&p1, alice.keypair_public, block);
        }
        p1.linearizer.update().await.unwrap();

        // P2: interleaved, alice-first chunks, updating constantly.
        let boot_blocks = blocks_of(&boot);
        let alice_blocks = blocks_of(&alice);
        deliver(&p2, boot.keypair_public, boot_blocks[0].clone());
        deliver(&p2, boot.keypair_public, boot_blocks[1].clone());
        p2.linearizer.update().await.unwrap();
        deliver(&p2, alice.keypair_public, alice_blocks[0].clone());
        p2.linearizer.update().await.unwrap();
        deliver(&p2, alice.keypair_public, alice_blocks[1].clone());
        deliver(&p2, boot.keypair_public, boot_blocks[2].clone());
        p2.linearizer.update().await.unwrap();

        assert_eq!(p1.view.applied_refs(), p2.view.applied_refs());
        assert_eq!(p1.view.scan().unwrap(), p2.view.scan().unwrap());
        assert_eq!(p1.view.version(), p2.view.version());
    }

    #[tokio::test]
    async fn blocks_from_unadmitted_writers_never_linearize() {
        let boot = source();
        let stranger = source();

        boot.store.append(&put("real", b"r", boot.keypair_public)).unwrap();
        stranger.store.append(&put("fake", b"f", stranger.keypair_public)).unwrap();

        let p = peer(boot.keypair_public);
        for block in blocks_of(&boot) {
            deliver(&p, boot.keypair_public, block);
        }
        for block in blocks_of(&stranger) {
            deliver(&p, stranger.keypair_public, block);
        }

        let outcome = p.linearizer.update().await.unwrap();
        assert_eq!(outcome.consumed, 1);
        assert!(p.view.get("fake").unwrap().is_none());
    }

    #[tokio::test]
    async fn removed_writer_blocks_stop_at_removal() {
        let boot = source();
        let alice = source();

        boot.store.append(&add_writer(alice.keypair_public)).unwrap();
        alice.store.append(&put("before", b"1", alice.keypair_public)).unwrap();
        alice
            .store
            .append(
                &Operation::RemoveWriter {
                    writer: *alice.keypair_public.as_bytes(),
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
        alice.store.append(&put("after", b"2", alice.keypair_public)).unwrap();

        let p = peer(boot.keypair_public);
        for block in blocks_of(&boot) {
            deliver(&p, boot.keypair_public, block);
        }
        for block in blocks_of(&alice) {
            deliver(&p, alice.keypair_public, block);
        }
        p.linearizer.update().await.unwrap();

        assert!(p.view.get("before").unwrap().is_some());
        assert!(p.view.get("after").unwrap().is_none());
        assert!(!p.view.is_writer(&alice.keypair_public));
    }
}
