//! Broadcast pipeline.
//!
//! Reads terminal output from a [`TerminalSource`], wraps each chunk as a
//! TERMINAL_DATA frame exactly once and fans the encoded bytes out to every
//! subscribed consumer.
//!
//! Each consumer owns a bounded queue drained by a dedicated writer task, so
//! a burst of output is absorbed by the queues instead of the sockets. When
//! a queue is full the broadcast loop waits for room, at most the write
//! timeout, before it gives up on that consumer. A consumer whose queue
//! stays full that long, or whose write fails, is dropped and its
//! connection closed. There is no replay: a new consumer only sees frames
//! emitted after it subscribed.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::{encode_payload, Content, Header, Shrink, ShrinkKind, TerminalContent};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionId};
use crate::error::{HostError, Result};
use crate::io::{write_full, OpContext, Tracker};
use crate::pty::TerminalSource;

/// Default depth of each consumer's frame queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Default bound on a single consumer write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type Mirror = Option<Box<dyn Write + Send>>;

/// Lifecycle of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// The broadcast loop is reading and fanning out.
    Running,
    /// `close` is in progress.
    Stopping,
    /// Consumers dropped and the source closed.
    Closed,
}

/// Pipeline tuning.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Frames buffered per consumer.
    pub queue_depth: usize,
    /// Bound on each consumer write, and on how long a full queue is
    /// waited on.
    pub write_timeout: Duration,
    /// Codec applied to raw terminal bytes.
    pub shrink: ShrinkKind,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shrink: ShrinkKind::None,
        }
    }
}

struct ConsumerHandle {
    conn: Arc<Connection>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
}

/// Fans terminal output out to subscribed connections.
pub struct Pipeline {
    consumers: RwLock<HashMap<ConnectionId, ConsumerHandle>>,
    source: Arc<dyn TerminalSource>,
    tracker: Arc<Tracker>,
    shrink: Box<dyn Shrink>,
    options: PipelineOptions,
    state: watch::Sender<PipelineState>,
    stop: CancellationToken,
    done: CancellationToken,
    tasks: TaskTracker,
}

impl Pipeline {
    /// Creates the pipeline and starts its broadcast loop.
    ///
    /// When `mirror` is set, raw terminal output is also copied there before
    /// it is shrunk and wrapped.
    pub fn start(
        source: Arc<dyn TerminalSource>,
        tracker: Arc<Tracker>,
        options: PipelineOptions,
        mirror: Mirror,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(PipelineState::Running);
        let pipeline = Arc::new(Self {
            consumers: RwLock::new(HashMap::new()),
            source,
            tracker,
            shrink: options.shrink.codec(),
            options,
            state,
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let runner = Arc::clone(&pipeline);
        pipeline.tasks.spawn(runner.broadcast_loop(mirror));
        pipeline
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Cancelled when the broadcast loop ends, whether because the terminal
    /// stream finished or because the pipeline was closed.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Adds a connection to the consumer set.
    ///
    /// Subscribing an already-subscribed connection is a no-op.
    pub async fn subscribe(&self, conn: Arc<Connection>) -> Result<()> {
        if self.state() != PipelineState::Running {
            return Err(HostError::Closed);
        }

        let mut consumers = self.consumers.write().await;
        if consumers.contains_key(&conn.id()) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.options.queue_depth.max(1));
        let cancel = self.stop.child_token();

        let writer = self.tasks.spawn(consumer_writer(
            Arc::clone(&conn),
            rx,
            cancel.clone(),
            Arc::clone(&self.tracker),
            self.options.write_timeout,
        ));

        tracing::debug!(conn_id = conn.id(), peer = %conn.peer(), "Consumer subscribed");
        consumers.insert(
            conn.id(),
            ConsumerHandle {
                conn,
                tx,
                cancel,
                writer,
            },
        );
        Ok(())
    }

    /// Removes a connection from the consumer set without closing it.
    ///
    /// Returns whether it was subscribed. Frames still queued for it are
    /// discarded, but a frame already being written is finished first, so
    /// the caller can write its own frames to the connection afterwards.
    pub async fn unsubscribe(&self, id: ConnectionId) -> bool {
        let removed = self.consumers.write().await.remove(&id);
        let Some(handle) = removed else {
            return false;
        };

        handle.cancel.cancel();
        if tokio::time::timeout(self.options.write_timeout, handle.writer)
            .await
            .is_err()
        {
            tracing::debug!(conn_id = id, "Consumer writer still busy after unsubscribe");
        }
        tracing::debug!(conn_id = id, "Consumer unsubscribed");
        true
    }

    /// Returns whether `id` is subscribed.
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.consumers.read().await.contains_key(&id)
    }

    /// Number of subscribed consumers.
    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Identifiers of all subscribed consumers.
    pub async fn consumer_ids(&self) -> Vec<ConnectionId> {
        self.consumers.read().await.keys().copied().collect()
    }

    /// Stops the loop, drops and closes every consumer, and closes the
    /// source. Waits at most `timeout` for background tasks to finish.
    /// Idempotent.
    pub async fn close(&self, timeout: Duration) {
        let began = self.state.send_if_modified(|state| {
            if *state == PipelineState::Running {
                *state = PipelineState::Stopping;
                true
            } else {
                false
            }
        });
        if !began {
            return;
        }

        self.stop.cancel();

        let drained: Vec<ConsumerHandle> =
            self.consumers.write().await.drain().map(|(_, h)| h).collect();
        let dropped = drained.len();
        for handle in drained {
            handle.cancel.cancel();
            self.tasks.spawn(async move { handle.conn.close().await });
        }

        let source = Arc::clone(&self.source);
        let closing = tokio::task::spawn_blocking(move || source.close());

        self.tasks.close();
        let settled = tokio::time::timeout(timeout, async {
            let _ = closing.await;
            self.tasks.wait().await;
        })
        .await;
        if settled.is_err() {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Pipeline tasks did not finish in time"
            );
        }

        self.state.send_replace(PipelineState::Closed);
        tracing::info!(consumers = dropped, "Pipeline closed");
    }

    async fn broadcast_loop(self: Arc<Self>, mut mirror: Mirror) {
        tracing::debug!("Broadcast loop started");

        loop {
            let source = Arc::clone(&self.source);
            let mut out = mirror.take();
            let read = tokio::task::spawn_blocking(move || {
                let result = source.read_chunk();
                let failed = match (&result, out.as_mut()) {
                    (Ok(Some(raw)), Some(w)) => w.write_all(raw).and_then(|()| w.flush()).err(),
                    _ => None,
                };
                if let Some(e) = failed {
                    tracing::warn!(error = %e, "Operator mirror failed, disabling");
                    out = None;
                }
                (result, out)
            });

            let joined = tokio::select! {
                _ = self.stop.cancelled() => break,
                joined = read => joined,
            };

            let result = match joined {
                Ok((result, out)) => {
                    mirror = out;
                    result
                }
                Err(e) => {
                    tracing::error!(error = %e, "Terminal read task failed");
                    break;
                }
            };

            match result {
                Ok(Some(raw)) => self.broadcast_chunk(&raw).await,
                Ok(None) => {
                    tracing::info!("Terminal stream ended");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error reading terminal output");
                    break;
                }
            }
        }

        self.done.cancel();
        tracing::debug!("Broadcast loop ended");
    }

    async fn broadcast_chunk(&self, raw: &[u8]) {
        let content = TerminalContent::new(Uuid::new_v4().to_string(), self.shrink.shrink(raw));
        let frame = match encode_payload(Header::TerminalData, Content::Terminal(content)) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::warn!(error = %e, bytes = raw.len(), "Dropping terminal chunk");
                return;
            }
        };

        let targets: Vec<(ConnectionId, mpsc::Sender<Bytes>)> = self
            .consumers
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.tx.clone()))
            .collect();

        let mut evicted = Vec::new();
        let mut waiting = JoinSet::new();
        let wait_limit = self.options.write_timeout;

        for (id, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    waiting.spawn(async move { (id, tx.send_timeout(frame, wait_limit).await.is_ok()) });
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(conn_id = id, "Consumer writer gone, dropping it");
                    evicted.push(id);
                }
            }
        }

        loop {
            let joined = tokio::select! {
                _ = self.stop.cancelled() => return,
                joined = waiting.join_next() => joined,
            };
            match joined {
                Some(Ok((_, true))) => {}
                Some(Ok((id, false))) => {
                    tracing::warn!(
                        conn_id = id,
                        timeout_ms = wait_limit.as_millis() as u64,
                        "Consumer queue stayed full, dropping it"
                    );
                    evicted.push(id);
                }
                Some(Err(e)) => tracing::warn!(error = %e, "Queue wait task failed"),
                None => break,
            }
        }

        if evicted.is_empty() {
            return;
        }
        let mut consumers = self.consumers.write().await;
        for id in evicted {
            if let Some(handle) = consumers.remove(&id) {
                handle.cancel.cancel();
                self.tasks.spawn(async move { handle.conn.close().await });
            }
        }
    }
}

/// Drains one consumer's queue.
///
/// `cancel` is only observed between frames; a frame that has started is
/// written out in full or the connection is closed.
async fn consumer_writer(
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    tracker: Arc<Tracker>,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let ctx = OpContext::with_timeout(CancellationToken::new(), write_timeout);
        match write_full(&ctx, &conn, &tracker, &frame).await {
            Ok(()) => {}
            Err(HostError::Closed) => break,
            Err(e) => {
                tracing::warn!(conn_id = conn.id(), error = %e, "Broadcast write failed, dropping consumer");
                conn.close().await;
                break;
            }
        }
    }
}
