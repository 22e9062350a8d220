//! Writer-exchange side protocol.
//!
//! Every peer channel carries one extra sub-channel, labeled
//! `pearsync-writer-exchange`, on which each side sends exactly one kind
//! of message: its local writer key, tagged with the workspace topic. The
//! writable side (in practice the bootstrap peer) turns unseen keys into
//! `add-writer` ops. The protocol is advisory — losing it only delays
//! admission; the membership rules live in the writer set.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use pearsync_core::keys::{PublicKey, Topic};

use crate::Result;

/// Label of the writer-exchange sub-channel.
pub const WRITER_EXCHANGE_LABEL: &str = "pearsync-writer-exchange";

/// The single message type of the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeMessage {
    /// The sender's local writer key.
    pub writer: [u8; 32],
    /// Workspace topic, so a misrouted frame is never acted on.
    pub topic: [u8; 32],
}

impl ExchangeMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Run the exchange on one peer channel: announce the local writer key,
/// then forward every valid, deduplicated remote key to `found_tx`.
///
/// Returns when the sub-channel closes. The caller decides what to do
/// with the keys (a writable node appends `add-writer`; everyone else
/// ignores them).
pub async fn run_exchange(
    local: PublicKey,
    topic: Topic,
    tx: mpsc::Sender<Vec<u8>>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    found_tx: mpsc::Sender<PublicKey>,
) -> Result<()> {
    let hello = ExchangeMessage {
        writer: *local.as_bytes(),
        topic: *topic.as_bytes(),
    };
    if tx.send(hello.encode()?).await.is_err() {
        return Ok(());
    }

    // Per-connection dedup; a chatty peer announces once.
    let mut seen: Vec<PublicKey> = Vec::new();

    while let Some(bytes) = rx.recv().await {
        let msg = match ExchangeMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("ignoring malformed writer-exchange frame: {e}");
                continue;
            }
        };
        if msg.topic != *topic.as_bytes() {
            tracing::debug!("ignoring writer-exchange frame for foreign topic");
            continue;
        }
        let remote = PublicKey(msg.writer);
        if remote == local || seen.contains(&remote) {
            continue;
        }
        seen.push(remote);
        if found_tx.send(remote).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pearsync_core::keys::Keypair;

    #[tokio::test]
    async fn exchange_announces_and_collects() {
        let key_a = Keypair::generate().public();
        let key_b = Keypair::generate().public();
        let topic = key_a.topic();

        let (tx_ab, mut rx_ab) = mpsc::channel(8);
        let (tx_ba, rx_ba) = mpsc::channel(8);
        let (found_tx, mut found_rx) = mpsc::channel(8);

        let session = tokio::spawn(run_exchange(key_a, topic, tx_ab, rx_ba, found_tx));

        // A announced itself.
        let hello = ExchangeMessage::decode(&rx_ab.recv().await.unwrap()).unwrap();
        assert_eq!(hello.writer, *key_a.as_bytes());
        assert_eq!(hello.topic, *topic.as_bytes());

        // B announces; A surfaces it exactly once despite repeats.
        let msg = ExchangeMessage {
            writer: *key_b.as_bytes(),
            topic: *topic.as_bytes(),
        };
        tx_ba.send(msg.encode().unwrap()).await.unwrap();
        tx_ba.send(msg.encode().unwrap()).await.unwrap();

        assert_eq!(found_rx.recv().await.unwrap(), key_b);
        drop(tx_ba);
        session.await.unwrap().unwrap();
        assert!(found_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn own_key_and_foreign_topics_are_ignored() {
        let key_a = Keypair::generate().public();
        let key_b = Keypair::generate().public();
        let topic = key_a.topic();

        let (tx_ab, _rx_ab) = mpsc::channel(8);
        let (tx_ba, rx_ba) = mpsc::channel(8);
        let (found_tx, mut found_rx) = mpsc::channel(8);

        let session = tokio::spawn(run_exchange(key_a, topic, tx_ab, rx_ba, found_tx));

        // Echo of our own key.
        tx_ba
            .send(
                ExchangeMessage {
                    writer: *key_a.as_bytes(),
                    topic: *topic.as_bytes(),
                }
                .encode()
                .unwrap(),
            )
            .await
            .unwrap();
        // Valid key on the wrong topic.
        tx_ba
            .send(
                ExchangeMessage {
                    writer: *key_b.as_bytes(),
                    topic: *key_b.topic().as_bytes(),
                }
                .encode()
                .unwrap(),
            )
            .await
            .unwrap();
        // Garbage.
        tx_ba.send(vec![0xde, 0xad]).await.unwrap();

        drop(tx_ba);
        session.await.unwrap().unwrap();
        assert!(found_rx.recv().await.is_none());
    }
}
