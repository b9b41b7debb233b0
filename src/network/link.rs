//! Duplex frame links
//!
//! A [`Link`] is one end of a persistent, ordered, bidirectional frame
//! channel. Over TCP each frame is one line of JSON; the in-memory pair is
//! used by the in-process relay hub and by tests.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::constants::{LINK_CHANNEL_CAPACITY, MAX_FRAME_SIZE};
use crate::error::NetworkError;
use crate::protocol::ControlMessage;

/// One end of a duplex frame channel
pub struct Link {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    peer: String,
    reader: Option<AbortHandle>,
}

impl Link {
    /// Create two connected in-memory ends
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);

        let a = Link {
            tx: a_tx,
            rx: a_rx,
            peer: "memory".to_string(),
            reader: None,
        };
        let b = Link {
            tx: b_tx,
            rx: b_rx,
            peer: "memory".to_string(),
            reader: None,
        };
        (a, b)
    }

    /// Wrap a connected TCP stream, spawning its reader and writer tasks
    pub fn from_tcp(stream: TcpStream) -> Link {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let (in_tx, in_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);

        let reader = tokio::spawn(read_frames(read_half, in_tx, peer.clone()));
        tokio::spawn(write_frames(write_half, out_rx, peer.clone()));

        Link {
            tx: out_tx,
            rx: in_rx,
            peer,
            reader: Some(reader.abort_handle()),
        }
    }

    /// Remote address, or `memory` for in-process links
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), NetworkError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| NetworkError::SendFailed(format!("link to {} closed", self.peer)))
    }

    /// Queue a frame without waiting; fails with `QueueFull` when the peer lags
    pub fn try_send(&self, frame: Bytes) -> Result<(), NetworkError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => NetworkError::QueueFull(self.peer.clone()),
            TrySendError::Closed(_) => NetworkError::SendFailed(format!("link to {} closed", self.peer)),
        })
    }

    pub async fn send_message(&self, message: &ControlMessage) -> Result<(), NetworkError> {
        self.send(encode(message)?).await
    }

    pub fn try_send_message(&self, message: &ControlMessage) -> Result<(), NetworkError> {
        self.try_send(encode(message)?)
    }

    /// Next inbound frame; `None` once the remote end has closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// A cloneable handle for sending without owning the link
    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }
}

fn encode(message: &ControlMessage) -> Result<Bytes, NetworkError> {
    message
        .encode()
        .map_err(|e| NetworkError::SendFailed(e.to_string()))
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_frames(read_half: OwnedReadHalf, tx: mpsc::Sender<Bytes>, peer: String) {
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_SIZE));

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                if tx.send(Bytes::from(line)).await.is_err() {
                    break;
                }
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!("Frame from {} exceeds {} bytes, closing", peer, MAX_FRAME_SIZE);
                break;
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::debug!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }
    tracing::debug!("Reader for {} finished", peer);
}

async fn write_frames(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, peer: String) {
    while let Some(frame) = rx.recv().await {
        let result = async {
            write_half.write_all(&frame).await?;
            write_half.write_all(b"\n").await
        }
        .await;

        if let Err(e) = result {
            tracing::debug!("Write to {} failed: {}", peer, e);
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Establishes links to a relay
pub trait Dialer: Send + Sync {
    fn dial(&self) -> BoxFuture<'_, Result<Link, NetworkError>>;

    /// Human-readable target for logs
    fn target(&self) -> String;
}

/// Dials a relay over TCP
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Dialer for TcpDialer {
    fn dial(&self) -> BoxFuture<'_, Result<Link, NetworkError>> {
        async move {
            let connect = TcpStream::connect(self.addr.as_str());
            let stream = tokio::time::timeout(self.connect_timeout, connect)
                .await
                .map_err(|_| NetworkError::Timeout)?
                .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", self.addr, e)))?;
            Ok(Link::from_tcp(stream))
        }
        .boxed()
    }

    fn target(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
