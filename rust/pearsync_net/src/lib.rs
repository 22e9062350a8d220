//! Pearsync networking: the seam between the sync engine and the DHT.
//!
//! The actual DHT (discovery, hole punching, key exchange, channel
//! encryption) is an external collaborator; this crate defines the
//! [`TopicTransport`] trait it must satisfy and everything pearsync layers
//! on top of a delivered peer channel:
//!
//! 1. **Multiplexing** ([`mux`]): labeled sub-channels over one byte
//!    stream, so per-log replication and the writer exchange share a
//!    single connection.
//!
//! 2. **Transports** ([`memory`], [`tcp`]): an in-process hub used by the
//!    test suites, and a TCP transport for LAN/dev deployments where peer
//!    addresses are known out of band.
//!
//! 3. **Writer exchange** ([`exchange`]): the advisory side protocol that
//!    tells the bootstrap peer which writer keys want admission.
//!
//! 4. **Backoff** ([`backoff`]): jittered exponential reconnect delays,
//!    bounded so a flapping peer cannot herd the DHT.

pub mod backoff;
pub mod exchange;
pub mod memory;
pub mod mux;
pub mod tcp;
pub mod topic;

use thiserror::Error;

pub use backoff::Backoff;
pub use exchange::{run_exchange, ExchangeMessage, WRITER_EXCHANGE_LABEL};
pub use memory::{MemoryHub, MemoryTransport};
pub use mux::{PeerChannel, SubChannel};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use topic::{JoinMode, PeerConnection, PeerStream, TopicHandle, TopicHandleDriver, TopicTransport};

#[derive(Debug, Error)]
pub enum NetError {
    /// Peer channel closed unexpectedly; the transport reconnects.
    #[error("transport failed: {0}")]
    TransportFailed(String),
    /// A sub-channel or handle was used after close.
    #[error("channel closed")]
    ChannelClosed,
    /// Peer spoke a different protocol or topic during the handshake.
    #[error("bad handshake: {0}")]
    BadHandshake(String),
    /// Incoming frame exceeded the size limit.
    #[error("oversized frame: {0} bytes")]
    OversizedFrame(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, NetError>;
