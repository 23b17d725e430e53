//! A framed, closable byte stream shared between tasks.
//!
//! The read half and the write half are locked independently so a client's
//! read loop never blocks broadcast writes to the same peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use protocol::FRAME_HEADER_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{HostError, Result};
use crate::io::OpContext;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long `close` waits for the write half to shut down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Exclusive hold on a connection's write half.
pub(crate) type WriteHalf<'a> = MutexGuard<'a, BoxedWriter>;

/// One peer's byte stream.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    closed: CancellationToken,
}

impl Connection {
    /// Wraps an arbitrary reader/writer pair.
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            closed: CancellationToken::new(),
        }
    }

    /// Wraps an accepted or connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, peer)
    }

    /// The connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote address as text.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Closes the connection. Idempotent.
    ///
    /// In-flight reads and writes observe the close and return
    /// [`HostError::Closed`].
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!(conn_id = self.id, error = %e, "Shutdown failed"),
            Err(_) => tracing::debug!(conn_id = self.id, "Shutdown timed out"),
        }
        tracing::debug!(conn_id = self.id, peer = %self.peer, "Connection closed");
    }

    /// Takes the write half, waiting at most as long as `ctx` allows.
    ///
    /// Holding it for a whole frame keeps frames from different writers
    /// from interleaving on the wire.
    pub(crate) async fn lock_writer(&self, ctx: &OpContext) -> Result<WriteHalf<'_>> {
        tokio::select! {
            biased;
            _ = ctx.token().cancelled() => Err(HostError::Cancelled),
            _ = self.closed.cancelled() => Err(HostError::Closed),
            _ = ctx.expired() => Err(HostError::Timeout),
            writer = self.writer.lock() => Ok(writer),
        }
    }

    /// Writes `frame[*written..]`, advancing `written` as bytes go out.
    ///
    /// A timed-out attempt leaves `written` at the last confirmed offset so
    /// the caller can resume instead of resending the whole frame.
    pub(crate) async fn write_from(
        &self,
        writer: &mut WriteHalf<'_>,
        ctx: &OpContext,
        frame: &[u8],
        written: &mut usize,
    ) -> Result<()> {
        let op = async {
            while *written < frame.len() {
                let n = writer.write(&frame[*written..]).await?;
                if n == 0 {
                    return Err(HostError::Closed);
                }
                *written += n;
            }
            writer.flush().await?;
            Ok(())
        };

        tokio::select! {
            biased;
            _ = ctx.token().cancelled() => Err(HostError::Cancelled),
            _ = self.closed.cancelled() => Err(HostError::Closed),
            _ = ctx.expired() => Err(HostError::Timeout),
            res = op => res,
        }
    }

    /// Reads exactly one frame body.
    ///
    /// The declared length is validated before any payload buffer is
    /// allocated.
    pub(crate) async fn read_frame(&self, ctx: &OpContext) -> Result<Vec<u8>> {
        let op = async {
            let mut reader = self.reader.lock().await;
            let mut header = [0u8; FRAME_HEADER_SIZE];
            reader.read_exact(&mut header).await?;

            let len = protocol::parse_length(header)?;
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(body)
        };

        tokio::select! {
            biased;
            _ = ctx.token().cancelled() => Err(HostError::Cancelled),
            _ = self.closed.cancelled() => Err(HostError::Closed),
            _ = ctx.expired() => Err(HostError::Timeout),
            res = op => res,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
