//! Block Store — a single writer's append-only hash-chained log.
//!
//! Appends are only possible when the store holds the writer's signing
//! key; every other copy of the log is populated through
//! [`insert_remote`](BlockStore::insert_remote), which verifies the
//! Ed25519 signature and chain hash before anything touches disk.
//!
//! Out-of-order received blocks park in a pending map and are drained as
//! the contiguous prefix catches up; `length()` counts the contiguous
//! durable prefix only, and readers never observe a gap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use pearsync_core::keys::{Keypair, PublicKey};
use tokio::sync::watch;

use crate::block::Block;
use crate::recovery;
use crate::segment::{SegmentReader, SegmentWriter};
use crate::{LogError, Result};

/// Default segment rotation threshold. Blocks embed file content, so
/// segments are sized generously.
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Outcome of ingesting a replicated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Block extended the contiguous prefix; new length attached.
    Applied(u64),
    /// Block is ahead of the contiguous prefix and was parked.
    Pending,
    /// Block was already present.
    Duplicate,
}

struct StoreInner {
    active_writer: Option<SegmentWriter>,
    segments: Vec<(PathBuf, u64)>,
    length: u64,
    head_hash: [u8; 32],
    pending: BTreeMap<u64, Block>,
    closed: bool,
    poisoned: bool,
}

/// A single writer's log.
pub struct BlockStore {
    key: PublicKey,
    keypair: Option<Keypair>,
    dir: PathBuf,
    segment_size: u64,
    inner: Mutex<StoreInner>,
    length_tx: watch::Sender<u64>,
}

impl BlockStore {
    /// Open (or create) the log for `key` in `dir`, running crash
    /// recovery. Pass the signing keypair only for the local writer's own
    /// log; its public half must equal `key`.
    pub fn open(
        dir: &Path,
        key: PublicKey,
        keypair: Option<Keypair>,
        segment_size: u64,
    ) -> Result<Self> {
        if let Some(kp) = &keypair {
            debug_assert_eq!(kp.public(), key);
        }
        std::fs::create_dir_all(dir)?;

        let recovered = recovery::recover(dir)?;
        tracing::debug!(
            key = %key,
            length = recovered.length,
            truncated = recovered.truncated_bytes,
            "block store opened"
        );

        let active_writer = match recovered.segments.last() {
            Some((path, _)) if std::fs::metadata(path)?.len() < segment_size => {
                Some(SegmentWriter::open_append(path)?)
            }
            _ => None,
        };

        let (length_tx, _) = watch::channel(recovered.length);
        Ok(Self {
            key,
            keypair,
            dir: dir.to_path_buf(),
            segment_size,
            inner: Mutex::new(StoreInner {
                active_writer,
                segments: recovered.segments,
                length: recovered.length,
                head_hash: recovered.head_hash,
                pending: BTreeMap::new(),
                closed: false,
                poisoned: false,
            }),
            length_tx,
        })
    }

    /// The writer key this log belongs to.
    pub fn key(&self) -> PublicKey {
        self.key
    }

    /// Whether this process holds the signing key for this log.
    pub fn is_writable(&self) -> bool {
        self.keypair.is_some()
    }

    /// Contiguous durable block count (== next seq to append).
    pub fn length(&self) -> u64 {
        self.inner.lock().length
    }

    /// Watch channel carrying the contiguous length as it grows.
    pub fn watch_length(&self) -> watch::Receiver<u64> {
        self.length_tx.subscribe()
    }

    /// Check the store is open and its disk state is still trusted.
    pub fn ready(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.poisoned {
            return Err(LogError::Fatal("log store is poisoned".into()));
        }
        if inner.closed {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    /// Atomically append a payload as the next block of the local
    /// writer's log. Returns the assigned seq.
    pub fn append(&self, payload: &[u8]) -> Result<u64> {
        let keypair = self.keypair.as_ref().ok_or(LogError::NotWritable)?;

        let mut inner = self.inner.lock();
        check_open(&inner)?;

        let seq = inner.length;
        let block = Block::sign(keypair, &inner.head_hash, seq, payload.to_vec());
        self.persist(&mut inner, &block)?;
        drop(inner);

        self.length_tx.send_replace(seq + 1);
        tracing::trace!(key = %self.key, seq, "block appended");
        Ok(seq)
    }

    /// Ingest a block received from a peer.
    ///
    /// Verification (signature + chain hash) happens only when the block
    /// lands on the contiguous prefix; parked blocks are re-checked as the
    /// prefix reaches them.
    pub fn insert_remote(&self, block: Block) -> Result<InsertOutcome> {
        let mut inner = self.inner.lock();
        check_open(&inner)?;

        if block.seq < inner.length {
            return Ok(InsertOutcome::Duplicate);
        }
        if block.seq > inner.length {
            inner.pending.insert(block.seq, block);
            return Ok(InsertOutcome::Pending);
        }

        if !block.verify(&self.key, &inner.head_hash) {
            return Err(LogError::ReplicationVerification { seq: block.seq });
        }
        self.persist(&mut inner, &block)?;

        // Drain parked blocks that are now contiguous.
        while let Some(next) = {
            let length = inner.length;
            inner.pending.remove(&length)
        } {
            if !next.verify(&self.key, &inner.head_hash) {
                // A parked block that fails the chain is dropped; the
                // replication session will re-request it.
                tracing::warn!(key = %self.key, seq = next.seq, "parked block failed verification");
                break;
            }
            self.persist(&mut inner, &next)?;
        }

        let length = inner.length;
        drop(inner);
        self.length_tx.send_replace(length);
        Ok(InsertOutcome::Applied(length))
    }

    /// Read a block from the local contiguous prefix.
    pub fn get_local(&self, seq: u64) -> Result<Option<Block>> {
        let inner = self.inner.lock();
        check_open(&inner)?;
        if seq >= inner.length {
            return Ok(None);
        }
        let idx = match inner
            .segments
            .binary_search_by_key(&seq, |(_, first)| *first)
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let (path, _) = &inner.segments[idx];
        let reader = SegmentReader::open(path)?;
        Ok(reader.find(seq)?)
    }

    /// Read a block, waiting up to `deadline` for peers to supply it.
    pub async fn get(&self, seq: u64, deadline: Duration) -> Result<Block> {
        if let Some(block) = self.get_local(seq)? {
            return Ok(block);
        }
        let mut rx = self.watch_length();
        let wait = async {
            loop {
                if *rx.borrow_and_update() > seq {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(LogError::Closed);
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(())) => self
                .get_local(seq)?
                .ok_or(LogError::NotAvailable { seq }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LogError::NotAvailable { seq }),
        }
    }

    /// Flush and seal the store. Further appends fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        if let Some(mut writer) = inner.active_writer.take() {
            writer.sync()?;
        }
        inner.closed = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Write one verified/signed block durably and advance the chain.
    /// A disk failure poisons the store: the chain tip on disk is no
    /// longer known, so further appends are refused.
    fn persist(&self, inner: &mut StoreInner, block: &Block) -> Result<()> {
        let result = self.persist_inner(inner, block);
        if result.is_err() {
            inner.poisoned = true;
            return Err(LogError::Fatal(format!(
                "disk write failed at seq {}",
                block.seq
            )));
        }
        inner.head_hash = block.chain_hash(&inner.head_hash);
        inner.length = block.seq + 1;
        Ok(())
    }

    fn persist_inner(&self, inner: &mut StoreInner, block: &Block) -> Result<()> {
        if inner.active_writer.is_none() {
            let first_seq = inner.length;
            let writer = SegmentWriter::new(&self.dir, first_seq, epoch_secs())?;
            inner.segments.push((writer.path().to_path_buf(), first_seq));
            inner.active_writer = Some(writer);
        }
        let writer = inner.active_writer.as_mut().unwrap();
        writer.append(block)?;
        writer.sync()?;

        if writer.bytes_written() >= self.segment_size {
            inner.active_writer = None;
        }
        Ok(())
    }
}

fn check_open(inner: &StoreInner) -> Result<()> {
    if inner.poisoned {
        return Err(LogError::Fatal("log store is poisoned".into()));
    }
    if inner.closed {
        return Err(LogError::Closed);
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ===========================================================================
// Tests
// ===========================================================================
