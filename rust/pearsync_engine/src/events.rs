//! The engine's typed event stream.
//!
//! One fixed enum delivered over a `tokio::sync::broadcast` channel; the
//! CLI's foreground mode and the daemon's status endpoint are the only
//! consumers. A lagging subscriber loses old events, never blocks sync.

use pearsync_core::keys::PublicKey;
use tokio::sync::broadcast;

/// Everything a sync engine reports while running.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer channel opened.
    PeerConnected { key: PublicKey },
    /// A peer channel died; the transport reconnects on its own.
    PeerDisconnected { key: PublicKey },
    /// A linearized `add-writer` admitted this key.
    WriterAdmitted { key: PublicKey },
    /// The local writer observed its own admission.
    Writable,
    /// A local change was pushed into the log.
    FileUploaded { path: String },
    /// A local deletion was pushed into the log.
    FileDeleted { path: String },
    /// A remote change was written to the local directory.
    FileDownloaded { path: String },
    /// A remote deletion was applied to the local directory.
    FileRemoved { path: String },
    /// One reconciliation pass finished; `ops` counts emitted log ops.
    PushCompleted { ops: u64 },
    /// One pull pass finished at this view version.
    PullCompleted { version: u64 },
    /// A per-file problem; the cycle continues.
    SyncError { path: Option<String>, message: String },
}

/// Broadcast capacity; events are advisory, so bounded and lossy.
const EVENT_CAPACITY: usize = 1024;

pub(crate) fn channel() -> broadcast::Sender<SyncEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}
