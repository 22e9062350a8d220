//! Pearsync logs: per-writer signed append-only block sequences.
//!
//! This crate provides:
//!
//! 1. **Block codec** ([`block`]): the length-prefixed wire frame, the
//!    Ed25519 signature over the chained hash, and verification.
//!
//! 2. **Persistence** ([`segment`], [`recovery`]): append-only segment
//!    files with per-record CRC32 and truncating crash recovery.
//!
//! 3. **Block Store** ([`store`]): a single writer's log — append (local
//!    writer only), verified ingestion of replicated blocks, deadline-bound
//!    reads, and a length watch for live consumers.
//!
//! 4. **Log Set** ([`set`]): all logs of one workspace, created on demand
//!    as writer keys become known.
//!
//! 5. **Replication** ([`replicate`]): the per-log `have/want/data` sync
//!    session run over one multiplexed sub-channel per (peer, log).
//!
//! Blocks are immutable once appended; truncation is not permitted. A log
//! is only ever written by the process holding its signing key; everything
//! else replicates and verifies.

pub mod block;
pub mod recovery;
pub mod replicate;
pub mod segment;
pub mod set;
pub mod store;

use thiserror::Error;

pub use block::{Block, CodecError};
pub use replicate::{replicate_log, SyncMessage};
pub use segment::SegmentError;
pub use set::LogSet;
pub use store::BlockStore;

/// Errors surfaced by log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Append attempted on a log this process cannot sign for.
    #[error("log is not writable by this process")]
    NotWritable,
    /// The log's disk state can no longer be trusted; reopen required.
    #[error("fatal log failure: {0}")]
    Fatal(String),
    /// A requested block was not supplied by any peer within the deadline.
    #[error("block {seq} not available")]
    NotAvailable { seq: u64 },
    /// A peer-supplied block failed signature or chain-hash verification.
    #[error("replication verification failed at seq {seq}")]
    ReplicationVerification { seq: u64 },
    /// The log was closed.
    #[error("log is closed")]
    Closed,
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("message codec error: {0}")]
    Message(#[from] bincode::Error),
}

/// Result type for log operations.
pub type Result<T> = std::result::Result<T, LogError>;
