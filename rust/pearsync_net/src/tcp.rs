//! TCP topic transport for LAN and dev deployments.
//!
//! The real DHT delivers authenticated, encrypted channels; this
//! transport covers the environments where peer addresses are known out
//! of band (tests, a LAN, a rendezvous box). Each side of a connection
//! sends a tiny plaintext handshake — magic, topic, public key — and the
//! connection is rejected unless the topics match. Dialers redial forever
//! with jittered exponential backoff until the topic is left.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use pearsync_core::keys::{PublicKey, Topic, KEY_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::backoff::Backoff;
use crate::topic::{JoinMode, PeerConnection, TopicHandle, TopicTransport};
use crate::{NetError, Result};

const HANDSHAKE_MAGIC: [u8; 4] = *b"PSYN";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct TcpTransportConfig {
    /// Address to accept peers on; `None` disables the server side.
    pub listen: Option<SocketAddr>,
    /// Peer addresses to dial and keep dialing.
    pub peers: Vec<SocketAddr>,
}

pub struct TcpTransport {
    local_key: PublicKey,
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(local_key: PublicKey, config: TcpTransportConfig) -> Self {
        Self { local_key, config }
    }
}

#[async_trait]
impl TopicTransport for TcpTransport {
    async fn join(&self, topic: Topic, mode: JoinMode) -> Result<TopicHandle> {
        let (handle, mut driver) = TopicHandle::pair();
        let (conn_tx, mut conn_rx) = mpsc::channel::<PeerConnection>(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        if mode.server {
            if let Some(addr) = self.config.listen {
                let listener = TcpListener::bind(addr).await?;
                tracing::info!(addr = %listener.local_addr()?, "accepting peers");
                tokio::spawn(accept_loop(
                    listener,
                    topic,
                    self.local_key,
                    conn_tx.clone(),
                    cancel_rx.clone(),
                ));
            }
        }

        if mode.client {
            for addr in self.config.peers.clone() {
                tokio::spawn(dial_loop(
                    addr,
                    topic,
                    self.local_key,
                    conn_tx.clone(),
                    cancel_rx.clone(),
                ));
            }
        }
        drop(conn_tx);
        driver.mark_flushed();

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
            let _ = cancel_tx.send(true);
        });

        Ok(handle)
    }
}

async fn accept_loop(
    listener: TcpListener,
    topic: Topic,
    local_key: PublicKey,
    conn_tx: mpsc::Sender<PeerConnection>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, addr)) = accepted else { break };
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    match handshake(stream, topic, local_key).await {
                        Ok((stream, remote_key)) => {
                            let (stream, _closed) = TrackedStream::new(stream);
                            let _ = conn_tx
                                .send(PeerConnection {
                                    remote_key,
                                    initiator: false,
                                    stream: Box::new(stream),
                                })
                                .await;
                        }
                        Err(e) => {
                            tracing::debug!(%addr, "inbound handshake failed: {e}");
                        }
                    }
                });
            }
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
    }
}

async fn dial_loop(
    addr: SocketAddr,
    topic: Topic,
    local_key: PublicKey,
    conn_tx: mpsc::Sender<PeerConnection>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::for_reconnect();
    loop {
        if *cancel.borrow() {
            return;
        }

        let attempt = async {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| NetError::TransportFailed(format!("connect to {addr} timed out")))??;
            handshake(stream, topic, local_key).await
        };

        match attempt.await {
            Ok((stream, remote_key)) => {
                backoff.reset();
                let (stream, mut closed) = TrackedStream::new(stream);
                if conn_tx
                    .send(PeerConnection {
                        remote_key,
                        initiator: true,
                        stream: Box::new(stream),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                // Hold off redialing until the delivered stream dies.
                tokio::select! {
                    _ = &mut closed => {}
                    _ = cancelled(&mut cancel) => return,
                }
                tracing::debug!(%addr, "peer connection closed, redialing");
            }
            Err(e) => {
                tracing::debug!(%addr, "dial failed: {e}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff.next_delay()) => {}
            _ = cancelled(&mut cancel) => return,
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Exchange `magic || topic || key` in both directions and verify.
async fn handshake(
    mut stream: TcpStream,
    topic: Topic,
    local_key: PublicKey,
) -> Result<(TcpStream, PublicKey)> {
    let exchange = async {
        let mut hello = Vec::with_capacity(4 + 32 + KEY_LEN);
        hello.extend_from_slice(&HANDSHAKE_MAGIC);
        hello.extend_from_slice(topic.as_bytes());
        hello.extend_from_slice(local_key.as_bytes());
        stream.write_all(&hello).await?;
        stream.flush().await?;

        let mut theirs = [0u8; 4 + 32 + KEY_LEN];
        stream.read_exact(&mut theirs).await?;
        if theirs[..4] != HANDSHAKE_MAGIC {
            return Err(NetError::BadHandshake("wrong magic".into()));
        }
        if theirs[4..36] != topic.as_bytes()[..] {
            return Err(NetError::BadHandshake("topic mismatch".into()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&theirs[36..]);
        Ok(PublicKey(key))
    };

    let remote_key = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| NetError::BadHandshake("handshake timed out".into()))??;
    Ok((stream, remote_key))
}

/// A TcpStream whose drop resolves a oneshot, so the dialer knows when to
/// redial.
struct TrackedStream {
    inner: TcpStream,
    _signal: DropSignal,
}

impl TrackedStream {
    fn new(inner: TcpStream) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner,
                _signal: DropSignal(Some(tx)),
            },
            rx,
        )
    }
}

struct DropSignal(Option<oneshot::Sender<()>>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
