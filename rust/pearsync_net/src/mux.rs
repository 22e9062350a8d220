//! Labeled sub-channel multiplexing over one peer stream.
//!
//! Every frame carries its sub-channel label, so both sides can open
//! sub-channels independently and a receiver learns about labels it has
//! never seen (a peer replicating a log we don't know yet). Frames for a
//! label that nobody has opened are buffered until someone does.
//!
//! Frame format:
//!   [len:u32][label_len:u16][label:utf8][payload]
//!
//! `len` counts everything after itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::topic::PeerStream;
use crate::{NetError, Result};

/// Upper bound on one frame; a put op embeds whole file content.
pub const MAX_FRAME: usize = 256 * 1024 * 1024;

const SUB_QUEUE: usize = 256;

/// One side of a labeled sub-channel.
pub struct SubChannel {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

struct Shared {
    subs: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    pending: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    new_label_tx: mpsc::Sender<String>,
}

/// A multiplexed peer connection.
pub struct PeerChannel {
    out_tx: mpsc::Sender<(String, Vec<u8>)>,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
}

impl PeerChannel {
    /// Wrap a transport stream. Returns the channel plus the feed of
    /// labels the *peer* opened first.
    pub fn new(stream: PeerStream) -> (Self, mpsc::Receiver<String>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel::<(String, Vec<u8>)>(SUB_QUEUE);
        let (new_label_tx, new_label_rx) = mpsc::channel(SUB_QUEUE);
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            subs: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            new_label_tx,
        });

        tokio::spawn(write_loop(write_half, out_rx, closed_tx.clone()));
        tokio::spawn(read_loop(read_half, shared.clone(), closed_tx));

        (
            Self {
                out_tx,
                shared,
                closed_rx,
            },
            new_label_rx,
        )
    }

    /// Open (or claim) the sub-channel with the given label. Frames the
    /// peer sent before we opened it are delivered first.
    pub fn open(&self, label: &str) -> SubChannel {
        let (in_tx, in_rx) = mpsc::channel(SUB_QUEUE);

        // Flush anything buffered for this label before registering, so
        // ordering is preserved.
        let buffered = self.shared.pending.lock().remove(label);
        if let Some(frames) = buffered {
            for frame in frames {
                // Capacity is SUB_QUEUE; buffered frames beyond it are
                // dropped, and replication re-requests by range.
                let _ = in_tx.try_send(frame);
            }
        }
        self.shared
            .subs
            .lock()
            .insert(label.to_string(), in_tx);

        // Outbound side: a forwarder stamps the label on each message.
        let (user_tx, mut fwd_rx) = mpsc::channel::<Vec<u8>>(SUB_QUEUE);
        let out_tx = self.out_tx.clone();
        let label = label.to_string();
        tokio::spawn(async move {
            while let Some(bytes) = fwd_rx.recv().await {
                if out_tx.send((label.clone(), bytes)).await.is_err() {
                    break;
                }
            }
        });

        SubChannel {
            tx: user_tx,
            rx: in_rx,
        }
    }

    /// Watch flipping to `true` once the underlying stream dies.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

async fn write_loop(
    mut write_half: tokio::io::WriteHalf<PeerStream>,
    mut out_rx: mpsc::Receiver<(String, Vec<u8>)>,
    closed_tx: watch::Sender<bool>,
) {
    while let Some((label, payload)) = out_rx.recv().await {
        let label_bytes = label.as_bytes();
        let len = 2 + label_bytes.len() + payload.len();

        let mut frame = Vec::with_capacity(4 + len);
        frame.extend_from_slice(&(len as u32).to_le_bytes());
        frame.extend_from_slice(&(label_bytes.len() as u16).to_le_bytes());
        frame.extend_from_slice(label_bytes);
        frame.extend_from_slice(&payload);

        if let Err(e) = write_half.write_all(&frame).await {
            tracing::debug!("peer write failed: {e}");
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
    let _ = closed_tx.send(true);
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<PeerStream>,
    shared: Arc<Shared>,
    closed_tx: watch::Sender<bool>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok((label, payload)) => {
                let sub = shared.subs.lock().get(&label).cloned();
                match sub {
                    Some(tx) => {
                        if tx.send(payload).await.is_err() {
                            // Receiver gone; future frames rebuffer so a
                            // reopen sees them.
                            shared.subs.lock().remove(&label);
                        }
                    }
                    None => {
                        let first = {
                            let mut pending = shared.pending.lock();
                            let entry = pending.entry(label.clone()).or_default();
                            let first = entry.is_empty();
                            entry.push(payload);
                            first
                        };
                        if first {
                            let _ = shared.new_label_tx.send(label).await;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!("peer read ended: {e}");
                break;
            }
        }
    }
    // Closing the sub senders wakes every session on this connection.
    shared.subs.lock().clear();
    let _ = closed_tx.send(true);
}

async fn read_frame(
    read_half: &mut tokio::io::ReadHalf<PeerStream>,
) -> Result<(String, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    read_half.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len < 2 {
        return Err(NetError::BadHandshake("short frame".into()));
    }
    if len > MAX_FRAME {
        return Err(NetError::OversizedFrame(len));
    }

    let mut body = vec![0u8; len];
    read_half.read_exact(&mut body).await?;

    let label_len = u16::from_le_bytes(body[..2].try_into().unwrap()) as usize;
    if body.len() < 2 + label_len {
        return Err(NetError::BadHandshake("bad label length".into()));
    }
    let label = String::from_utf8(body[2..2 + label_len].to_vec())
        .map_err(|_| NetError::BadHandshake("label is not utf8".into()))?;
    let payload = body[2 + label_len..].to_vec();
    Ok((label, payload))
}

// ===========================================================================
// Tests
// ===========================================================================
