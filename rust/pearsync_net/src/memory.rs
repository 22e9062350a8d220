//! In-process topic transport for tests.
//!
//! A [`MemoryHub`] stands in for the DHT: transports created from the
//! same hub rendezvous by topic, and each pair gets a
//! `tokio::io::duplex` byte channel. Everything is in-memory and ordered;
//! "network cut" scenarios are modeled by leaving and re-joining.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pearsync_core::keys::{PublicKey, Topic};
use tokio::sync::mpsc;

use crate::topic::{
    JoinMode, PeerConnection, TopicHandle, TopicHandleDriver, TopicTransport,
};
use crate::Result;

const DUPLEX_BUFFER: usize = 4 * 1024 * 1024;

struct Member {
    key: PublicKey,
    conn_tx: mpsc::Sender<PeerConnection>,
}

/// The shared rendezvous point.
#[derive(Default)]
pub struct MemoryHub {
    topics: Mutex<HashMap<[u8; 32], Vec<Member>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport handle for one simulated node.
    pub fn transport(self: &Arc<Self>, local_key: PublicKey) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            local_key,
        }
    }

    fn remove_member(&self, topic: &Topic, key: &PublicKey) {
        let mut topics = self.topics.lock();
        if let Some(members) = topics.get_mut(topic.as_bytes()) {
            members.retain(|m| m.key != *key);
            if members.is_empty() {
                topics.remove(topic.as_bytes());
            }
        }
    }
}

/// One node's view of the hub.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local_key: PublicKey,
}

#[async_trait]
impl TopicTransport for MemoryTransport {
    async fn join(&self, topic: Topic, mode: JoinMode) -> Result<TopicHandle> {
        let (handle, mut driver) = TopicHandle::pair();
        let (conn_tx, mut conn_rx) = mpsc::channel::<PeerConnection>(16);

        // Connect to every member already on the topic; we initiate.
        let peers: Vec<Member> = {
            let mut topics = self.hub.topics.lock();
            let members = topics.entry(*topic.as_bytes()).or_default();
            let existing: Vec<Member> = members
                .iter()
                .map(|m| Member {
                    key: m.key,
                    conn_tx: m.conn_tx.clone(),
                })
                .collect();
            if mode.server {
                members.push(Member {
                    key: self.local_key,
                    conn_tx: conn_tx.clone(),
                });
            }
            existing
        };

        if mode.client {
            for peer in peers {
                let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
                let delivered = peer
                    .conn_tx
                    .send(PeerConnection {
                        remote_key: self.local_key,
                        initiator: false,
                        stream: Box::new(theirs),
                    })
                    .await
                    .is_ok();
                if !delivered {
                    continue;
                }
                let _ = conn_tx
                    .send(PeerConnection {
                        remote_key: peer.key,
                        initiator: true,
                        stream: Box::new(ours),
                    })
                    .await;
            }
        }
        driver.mark_flushed();

        // Pump accepted + initiated connections into the handle until the
        // node leaves the topic.
        let hub = self.hub.clone();
        let local_key = self.local_key;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    conn = conn_rx.recv() => {
                        match conn {
                            Some(conn) => {
                                if !driver.deliver(conn).await {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = driver.left() => break,
                }
            }
            hub.remove_member(&topic, &local_key);
        });

        Ok(handle)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pearsync_core::keys::Keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn topic() -> Topic {
        Keypair::generate().public().topic()
    }

    #[tokio::test]
    async fn two_nodes_meet_on_a_topic() {
        let hub = MemoryHub::new();
        let key_a = Keypair::generate().public();
        let key_b = Keypair::generate().public();
        let topic = topic();

        let mut handle_a = hub
            .transport(key_a)
            .join(topic, JoinMode::default())
            .await
            .unwrap();
        handle_a.flushed().await;

        let mut handle_b = hub
            .transport(key_b)
            .join(topic, JoinMode::default())
            .await
            .unwrap();

        let conn_b = handle_b.next_connection().await.unwrap();
        assert_eq!(conn_b.remote_key, key_a);
        assert!(conn_b.initiator);

        let conn_a = handle_a.next_connection().await.unwrap();
        assert_eq!(conn_a.remote_key, key_b);
        assert!(!conn_a.initiator);

        // The streams really are connected.
        let mut sa = conn_a.stream;
        let mut sb = conn_b.stream;
        sb.write_all(b"ping").await.unwrap();
        sb.flush().await.unwrap();
        let mut buf = [0u8; 4];
        sa.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let hub = MemoryHub::new();
        let key_a = Keypair::generate().public();
        let key_b = Keypair::generate().public();

        let mut handle_a = hub
            .transport(key_a)
            .join(topic(), JoinMode::default())
            .await
            .unwrap();
        let _handle_b = hub
            .transport(key_b)
            .join(topic(), JoinMode::default())
            .await
            .unwrap();

        handle_a.flushed().await;
        tokio::select! {
            _ = handle_a.next_connection() => panic!("peers on different topics met"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
    }

    #[tokio::test]
    async fn leave_removes_member() {
        let hub = MemoryHub::new();
        let key_a = Keypair::generate().public();
        let key_b = Keypair::generate().public();
        let topic = topic();

        let handle_a = hub
            .transport(key_a)
            .join(topic, JoinMode::default())
            .await
            .unwrap();
        handle_a.leave();
        // Give the pump task a beat to unregister.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut handle_b = hub
            .transport(key_b)
            .join(topic, JoinMode::default())
            .await
            .unwrap();
        handle_b.flushed().await;
        tokio::select! {
            conn = handle_b.next_connection() => {
                panic!("connected to a departed peer: {:?}", conn.map(|c| c.remote_key));
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
    }
}
