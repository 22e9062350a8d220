//! Pearsync engine: from replicated logs to a synchronized directory.
//!
//! The pieces, in data-flow order:
//!
//! 1. **Linearizer** ([`linearizer`]): merges the partially ordered blocks
//!    of all admitted writer logs into one deterministic total order and
//!    folds it into the view, rewinding and replaying when late blocks
//!    sort before already-applied ones.
//!
//! 2. **View** ([`view`]): the persisted manifest — `path → FileMeta` plus
//!    the writer membership — materialized purely from the linearized op
//!    prefix, with an undo log so any prefix state can be restored.
//!
//! 3. **Writer set** ([`writers`]): the membership rules (member-authored
//!    `add-writer`, self-authored `remove-writer`) shared by the view and
//!    the linearizer's merge simulation.
//!
//! 4. **Sync engine** ([`sync`]): bidirectional reconciliation between the
//!    local directory and the view — push, pull, filesystem watching, the
//!    peer connection lifecycle and the writer-exchange hook.
//!
//! Events surface on a typed broadcast stream ([`events`]); per-file sync
//! problems are events, never aborts.

pub mod events;
pub mod index;
pub mod linearizer;
pub mod sync;
pub mod view;
pub mod watch;
pub mod writers;

use thiserror::Error;

pub use events::SyncEvent;
pub use linearizer::{Linearizer, UpdateOutcome};
pub use sync::{SyncEngine, SyncEngineConfig, SyncStatus};
pub use view::{View, ViewError};
pub use writers::WriterSet;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The local writer is not (yet) in the writer set.
    #[error("not writable: local writer is not admitted")]
    NotWritable,
    /// A joiner never observed its `add-writer` within the deadline.
    #[error("writer admission timed out")]
    WriterAdmissionTimeout,
    /// Local disk error; the sync cycle aborts but the engine stays open.
    #[error("I/O error: {0}")]
    IoFailed(#[from] std::io::Error),
    /// The engine can no longer be used and must be reopened.
    #[error("fatal engine failure: {0}")]
    Fatal(String),
    #[error(transparent)]
    Log(#[from] pearsync_log::LogError),
    #[error(transparent)]
    Net(#[from] pearsync_net::NetError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error("ignore pattern error: {0}")]
    Ignore(#[from] globset::Error),
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
