//! Per-log replication session.
//!
//! One session runs per (peer channel, log). The two sides exchange
//! `have` summaries; a side missing blocks sends `want` for the absent
//! range and the other streams `data` frames in the block wire format.
//! Local appends re-announce automatically through the store's length
//! watch, so a session is live: it keeps pushing new blocks for as long
//! as the channel stays open.
//!
//! A peer that supplies a block failing signature or chain verification
//! ends the session for this log only; the carrying channel stays usable
//! for the peer's other logs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::block::Block;
use crate::store::BlockStore;
use crate::{LogError, Result};

/// Wire messages of one replication session, bincode-encoded inside the
/// sub-channel frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Contiguous length announcement.
    Have { length: u64 },
    /// Request for the block range `[from, to)`.
    Want { from: u64, to: u64 },
    /// One block, in the standard wire frame.
    Data { frame: Vec<u8> },
}

impl SyncMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Drive one replication session until the channel closes, shutdown is
/// signaled, or the peer proves untrustworthy for this log.
pub async fn replicate_log(
    store: Arc<BlockStore>,
    tx: mpsc::Sender<Vec<u8>>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut length_rx = store.watch_length();
    let mut announced: u64 = store.length();

    send(&tx, &SyncMessage::Have { length: announced }).await?;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            changed = length_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let length = *length_rx.borrow_and_update();
                if length > announced {
                    announced = length;
                    send(&tx, &SyncMessage::Have { length }).await?;
                }
            }
            msg = rx.recv() => {
                let Some(bytes) = msg else {
                    // Channel closed; the transport will reconnect and a
                    // fresh session restarts from new have summaries.
                    return Ok(());
                };
                match SyncMessage::decode(&bytes)? {
                    SyncMessage::Have { length } => {
                        let local = store.length();
                        if length > local {
                            send(&tx, &SyncMessage::Want { from: local, to: length }).await?;
                        }
                    }
                    SyncMessage::Want { from, to } => {
                        let to = to.min(store.length());
                        for seq in from..to {
                            let Some(block) = store.get_local(seq)? else {
                                break;
                            };
                            send(&tx, &SyncMessage::Data { frame: block.encode_frame() }).await?;
                        }
                    }
                    SyncMessage::Data { frame } => {
                        let block = Block::decode_frame(&frame)?;
                        let seq = block.seq;
                        match store.insert_remote(block) {
                            Ok(_) => {}
                            Err(e @ LogError::ReplicationVerification { .. }) => {
                                tracing::warn!(
                                    key = %store.key(),
                                    seq,
                                    "dropping peer for this log: {e}"
                                );
                                return Err(e);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
    }
}

async fn send(tx: &mpsc::Sender<Vec<u8>>, msg: &SyncMessage) -> Result<()> {
    tx.send(msg.encode()?)
        .await
        .map_err(|_| LogError::Closed)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pearsync_core::keys::Keypair;
    use tempfile::TempDir;

    use crate::store::DEFAULT_SEGMENT_SIZE;

    fn writable(dir: &std::path::Path) -> Arc<BlockStore> {
        let kp = Keypair::generate();
        let key = kp.public();
        Arc::new(BlockStore::open(dir, key, Some(kp), DEFAULT_SEGMENT_SIZE).unwrap())
    }

    fn replica_of(dir: &std::path::Path, source: &BlockStore) -> Arc<BlockStore> {
        Arc::new(BlockStore::open(dir, source.key(), None, DEFAULT_SEGMENT_SIZE).unwrap())
    }

    /// Wire two sessions for the same log back to back.
    fn connect(
        a: Arc<BlockStore>,
        b: Arc<BlockStore>,
        shutdown: watch::Receiver<bool>,
    ) -> (
        tokio::task::JoinHandle<Result<()>>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (tx_ab, rx_ab) = mpsc::channel(64);
        let (tx_ba, rx_ba) = mpsc::channel(64);
        let ha = tokio::spawn(replicate_log(a, tx_ab, rx_ba, shutdown.clone()));
        let hb = tokio::spawn(replicate_log(b, tx_ba, rx_ab, shutdown));
        (ha, hb)
    }

    async fn wait_for_length(store: &BlockStore, want: u64) {
        let mut rx = store.watch_length();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() < want {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("replication did not catch up");
    }

    #[tokio::test]
    async fn replica_catches_up_and_stays_live() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let source = writable(da.path());
        let replica = replica_of(db.path(), &source);

        // Pre-existing history.
        for i in 0..3 {
            source.append(format!("old-{i}").as_bytes()).unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _handles = connect(source.clone(), replica.clone(), shutdown_rx);

        wait_for_length(&replica, 3).await;

        // Live append replicates without a new session.
        source.append(b"live").unwrap();
        wait_for_length(&replica, 4).await;
        assert_eq!(replica.get_local(3).unwrap().unwrap().payload, b"live");

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn forged_data_ends_session() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let source = writable(da.path());
        let replica = replica_of(db.path(), &source);
        source.append(b"real").unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);

        let session = tokio::spawn(replicate_log(replica.clone(), out_tx, rx, shutdown_rx));

        // Hand the session a forged block for seq 0.
        let forger = Keypair::generate();
        let forged = Block::sign(&forger, &crate::block::GENESIS_HASH, 0, b"evil".to_vec());
        tx.send(
            SyncMessage::Data {
                frame: forged.encode_frame(),
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result.unwrap_err(),
            LogError::ReplicationVerification { seq: 0 }
        ));
        assert_eq!(replica.length(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_session_cleanly() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let source = writable(da.path());
        let replica = replica_of(db.path(), &source);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ha, hb) = connect(source, replica, shutdown_rx);
        shutdown_tx.send(true).unwrap();

        let ra = tokio::time::timeout(Duration::from_secs(5), ha).await.unwrap();
        let rb = tokio::time::timeout(Duration::from_secs(5), hb).await.unwrap();
        assert!(ra.unwrap().is_ok());
        assert!(rb.unwrap().is_ok());
    }
}
