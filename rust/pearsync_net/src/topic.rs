//! The topic transport seam.
//!
//! A transport joins a 32-byte topic on whatever rendezvous medium it
//! implements and delivers, for as long as the join is live, a stream of
//! bidirectional byte channels to peers on the same topic. Channels are
//! assumed mutually authenticated and encrypted by the transport; this
//! crate never sees key exchange.

use async_trait::async_trait;
use pearsync_core::keys::{PublicKey, Topic};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::Result;

/// Announcer/client flags for a join, mirroring DHT semantics: a server
/// announces the topic, a client looks it up. Most peers are both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinMode {
    pub server: bool,
    pub client: bool,
}

impl Default for JoinMode {
    fn default() -> Self {
        Self {
            server: true,
            client: true,
        }
    }
}

/// Object-safe byte stream; what a transport hands us per peer.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type PeerStream = Box<dyn Duplex>;

/// One established peer channel.
pub struct PeerConnection {
    /// The peer's authenticated 32-byte public key.
    pub remote_key: PublicKey,
    /// Whether the local side initiated the connection.
    pub initiator: bool,
    pub stream: PeerStream,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote_key", &self.remote_key)
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}

/// A transport capable of joining workspace topics.
#[async_trait]
pub trait TopicTransport: Send + Sync + 'static {
    async fn join(&self, topic: Topic, mode: JoinMode) -> Result<TopicHandle>;
}

/// The live side of one joined topic.
pub struct TopicHandle {
    connections: mpsc::Receiver<PeerConnection>,
    flushed: Option<oneshot::Receiver<()>>,
    leave_tx: watch::Sender<bool>,
}

impl TopicHandle {
    /// Build a handle plus the driver half the transport implementation
    /// keeps to feed it.
    pub fn pair() -> (TopicHandle, TopicHandleDriver) {
        let (conn_tx, connections) = mpsc::channel(16);
        let (flushed_tx, flushed_rx) = oneshot::channel();
        let (leave_tx, leave_rx) = watch::channel(false);
        (
            TopicHandle {
                connections,
                flushed: Some(flushed_rx),
                leave_tx,
            },
            TopicHandleDriver {
                conn_tx,
                flushed_tx: Some(flushed_tx),
                leave_rx,
            },
        )
    }

    /// Next peer channel, as they open. `None` once the transport stops
    /// serving this topic.
    pub async fn next_connection(&mut self) -> Option<PeerConnection> {
        self.connections.recv().await
    }

    /// Completes once the initial rendezvous round trip has finished:
    /// every peer discoverable at join time has been dialed.
    pub async fn flushed(&mut self) {
        if let Some(rx) = self.flushed.take() {
            let _ = rx.await;
        }
    }

    /// Stop announcing and tear down associated channels.
    pub fn leave(self) {
        let _ = self.leave_tx.send(true);
    }
}

/// Transport-side driver for a [`TopicHandle`].
pub struct TopicHandleDriver {
    conn_tx: mpsc::Sender<PeerConnection>,
    flushed_tx: Option<oneshot::Sender<()>>,
    leave_rx: watch::Receiver<bool>,
}

impl TopicHandleDriver {
    /// Deliver a newly established peer channel. Returns false if the
    /// handle is gone (left or dropped).
    pub async fn deliver(&self, conn: PeerConnection) -> bool {
        self.conn_tx.send(conn).await.is_ok()
    }

    /// Mark the initial discovery round trip complete.
    pub fn mark_flushed(&mut self) {
        if let Some(tx) = self.flushed_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Resolves when the handle leaves the topic (or is dropped).
    pub async fn left(&mut self) {
        loop {
            if *self.leave_rx.borrow_and_update() {
                return;
            }
            if self.leave_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-blocking check of the leave flag.
    pub fn has_left(&self) -> bool {
        *self.leave_rx.borrow()
    }
}
