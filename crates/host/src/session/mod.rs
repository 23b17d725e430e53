//! The shared-terminal session.
//!
//! A [`Session`] owns the TCP listener, the client registry, the broadcast
//! pipeline and the rotating passphrase. Each accepted connection moves
//! through four phases:
//!
//! ```text
//! Connecting ──► Authenticating ──► Active ──► Closing
//!      │               │                          ▲
//!      └─ SERVER_FULL ─┴──── AUTH_FAILED ─────────┘
//! ```
//!
//! The core never installs signal handlers. Callers translate whatever
//! should stop the session into the [`CancellationToken`] passed to
//! [`Session::run`], or call [`Session::end`] directly.

pub mod handshake;
pub mod registry;

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Content, ErrorCode, ErrorMessage, Header, InfoMessage, InfoType};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::Connection;
use crate::error::{HostError, Result};
use crate::io::{recv_payload, send_payload, OpContext, Tracker};
use crate::passphrase::{fresh_secret, PassphraseAuthority, Secret};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::pty::TerminalSource;

pub use handshake::{Handshake, MAX_AUTH_ATTEMPTS};
pub use registry::{ClientId, ClientRecord, ClientSummary, Registry};

/// Quiescence rounds granted during shutdown.
pub const QUIESCE_POLLS: u32 = 3;

/// Length of one quiescence round. The whole wait is capped at
/// `QUIESCE_POLLS` rounds.
pub const QUIESCE_ROUND: Duration = Duration::from_secs(5);

/// How often the tracker is checked while waiting.
pub const QUIESCE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Session tuning, usually built from the config file.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Display name of the operator.
    pub owner: String,
    /// Maximum participants, owner included.
    pub max_clients: usize,
    /// How often the passphrase is regenerated.
    pub rotation_interval: Duration,
    /// Expected heartbeat spacing. A client silent for twice this is dropped.
    pub heartbeat_interval: Duration,
    /// Bound on each handshake round.
    pub auth_timeout: Duration,
    /// Bound on refusal and farewell frames.
    pub kick_timeout: Duration,
    /// Bound on the whole of [`Session::end`].
    pub shutdown_timeout: Duration,
    /// Broadcast pipeline tuning.
    pub pipeline: PipelineOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 42024)),
            owner: "host".to_string(),
            max_clients: 9,
            rotation_interval: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(60),
            kick_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            pipeline: PipelineOptions::default(),
        }
    }
}

/// Outcome of [`Session::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Clients that were sent INFO(SHUTDOWN).
    pub notified: usize,
    /// Whether in-flight reads and writes drained before clients were
    /// dropped. `false` means the quiescence wait timed out.
    pub quiesced: bool,
}

struct SessionInner {
    config: SessionConfig,
    registry: Registry,
    pipeline: Arc<Pipeline>,
    tracker: Arc<Tracker>,
    authority: Arc<dyn PassphraseAuthority>,
    secret: watch::Sender<Secret>,
    handshake: Handshake,
    local_addr: SocketAddr,
    /// Stops the accept loop and the rotation timer.
    accept_stop: CancellationToken,
    /// Interrupts handshakes and client read loops.
    io_cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    tasks: TaskTracker,
    ended: Mutex<Option<ShutdownReport>>,
}

/// A running shared-terminal session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Binds the listener, starts the broadcast pipeline over `source`, and
    /// begins accepting viewers.
    ///
    /// `mirror` receives a copy of the raw terminal output, typically the
    /// operator's stdout.
    pub async fn bind(
        config: SessionConfig,
        authority: Arc<dyn PassphraseAuthority>,
        source: Arc<dyn TerminalSource>,
        mirror: Option<Box<dyn Write + Send>>,
    ) -> Result<Self> {
        let secret = fresh_secret(Arc::clone(&authority)).await?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let tracker = Tracker::new();
        let pipeline = Pipeline::start(source, Arc::clone(&tracker), config.pipeline, mirror);

        tracing::info!(
            addr = %local_addr,
            owner = %config.owner,
            max_clients = config.max_clients,
            passphrase = %secret.passphrase,
            "Session started"
        );

        let (secret, secret_rx) = watch::channel(secret);
        let io_cancel = CancellationToken::new();
        let handshake = Handshake {
            authority: Arc::clone(&authority),
            secret: secret_rx,
            tracker: Arc::clone(&tracker),
            attempt_timeout: config.auth_timeout,
            cancel: io_cancel.clone(),
        };

        let inner = Arc::new(SessionInner {
            registry: Registry::new(config.owner.clone(), config.max_clients),
            config,
            pipeline,
            tracker,
            authority,
            secret,
            handshake,
            local_addr,
            accept_stop: CancellationToken::new(),
            io_cancel,
            accept_task: Mutex::new(None),
            tasks: TaskTracker::new(),
            ended: Mutex::new(None),
        });

        let accept = tokio::spawn(Arc::clone(&inner).accept_loop(listener));
        *inner.accept_task.lock().await = Some(accept);
        inner.tasks.spawn(Arc::clone(&inner).rotation_loop());

        Ok(Self { inner })
    }

    /// Serves until `cancel` fires or the shell exits, then ends the session.
    pub async fn run(&self, cancel: CancellationToken) -> ShutdownReport {
        let done = self.inner.pipeline.done();
        tokio::select! {
            _ = cancel.cancelled() => tracing::info!("Shutdown requested"),
            _ = done.cancelled() => tracing::info!("Shell exited, ending session"),
        }
        self.end().await
    }

    /// Ends the session. Idempotent; later calls return the first report.
    ///
    /// Admissions stop before the tracker is polled, so no new client can be
    /// registered while in-flight operations drain.
    pub async fn end(&self) -> ShutdownReport {
        let mut ended = self.inner.ended.lock().await;
        if let Some(report) = *ended {
            return report;
        }

        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.shutdown_timeout;

        inner.accept_stop.cancel();
        inner.registry.seal().await;
        if let Some(handle) = inner.accept_task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Accept loop panicked");
            }
        }
        inner.io_cancel.cancel();

        let quiesced = inner.wait_quiescent(deadline).await;
        if !quiesced {
            tracing::warn!(
                reads = inner.tracker.reads(),
                writes = inner.tracker.writes(),
                "In-flight operations did not drain, continuing shutdown"
            );
        }

        let notified = inner.notify_shutdown().await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        inner.pipeline.close(remaining).await;

        inner.tasks.close();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, inner.tasks.wait()).await.is_err() {
            tracing::warn!("Session tasks did not finish in time");
        }

        let report = ShutdownReport { notified, quiesced };
        tracing::info!(notified, quiesced, "Session ended");
        *ended = Some(report);
        report
    }

    /// The passphrase viewers must present right now.
    pub fn current_passphrase(&self) -> String {
        self.inner.secret.borrow().passphrase.clone()
    }

    /// Follows passphrase rotations.
    pub fn passphrase_updates(&self) -> watch::Receiver<Secret> {
        self.inner.secret.subscribe()
    }

    /// Connected viewers, owner excluded.
    pub async fn client_list(&self) -> Vec<ClientSummary> {
        self.inner.registry.summaries().await
    }

    /// `"current/max"`, owner included.
    pub async fn client_count_label(&self) -> String {
        self.inner.registry.count_label().await
    }

    /// Number of participants, owner included.
    pub async fn client_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// In-flight operation counters.
    pub fn tracker(&self) -> Arc<Tracker> {
        Arc::clone(&self.inner.tracker)
    }

    /// The broadcast pipeline.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_addr", &self.inner.local_addr)
            .field("owner", &self.inner.config.owner)
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.accept_stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(peer = %addr, "Accepted connection");
                    let conn = Arc::new(Connection::from_tcp(stream));
                    let inner = Arc::clone(&self);
                    self.tasks.spawn(async move { inner.handle_connection(conn).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        tracing::debug!(addr = %self.local_addr, "Listener closed");
    }

    async fn handle_connection(self: Arc<Self>, conn: Arc<Connection>) {
        if self.registry.is_full().await {
            tracing::info!(peer = %conn.peer(), "Session full, refusing connection");
            self.kick(&conn, ErrorCode::ServerFull, "server_full", "The session is full")
                .await;
            return;
        }

        let username = match self.handshake.run(&conn).await {
            Ok(username) => username,
            Err(HostError::Cancelled) => {
                conn.close().await;
                return;
            }
            Err(e @ (HostError::AuthExhausted { .. } | HostError::EarlyExit | HostError::UnexpectedFrame(_))) => {
                tracing::info!(peer = %conn.peer(), error = %e, "Authentication failed");
                self.kick(&conn, ErrorCode::AuthFailed, "auth_failed", &e.to_string())
                    .await;
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %conn.peer(), error = %e, "Handshake aborted");
                conn.close().await;
                return;
            }
        };

        let client_id = match self.registry.insert(username.clone(), Arc::clone(&conn)).await {
            Ok(id) => id,
            Err(HostError::Capacity { .. }) => {
                self.kick(&conn, ErrorCode::ServerFull, "server_full", "The session is full")
                    .await;
                return;
            }
            Err(_) => {
                self.kick(
                    &conn,
                    ErrorCode::ServerShutdown,
                    "server_shutdown",
                    "The session is shutting down",
                )
                .await;
                return;
            }
        };

        if let Err(e) = self.pipeline.subscribe(Arc::clone(&conn)).await {
            tracing::debug!(client_id = %client_id, error = %e, "Subscribe failed");
            self.drop_client(client_id, &conn).await;
            return;
        }

        let ctx = OpContext::with_timeout(self.io_cancel.clone(), self.config.auth_timeout);
        let welcome = Content::Info(InfoMessage::new(
            InfoType::AuthSuccess,
            format!("Welcome to {}'s session", self.config.owner),
        ));
        if let Err(e) = send_payload(&ctx, &conn, &self.tracker, Header::Info, welcome).await {
            tracing::debug!(client_id = %client_id, error = %e, "Failed to confirm admission");
            if !matches!(e, HostError::Cancelled) {
                self.drop_client(client_id, &conn).await;
            }
            return;
        }

        tracing::info!(
            client_id = %client_id,
            username = %username,
            peer = %conn.peer(),
            "Client joined"
        );
        self.client_loop(client_id, conn).await;
    }

    async fn client_loop(&self, client_id: ClientId, conn: Arc<Connection>) {
        let idle = self.config.heartbeat_interval * 2;

        loop {
            let ctx = OpContext::with_timeout(self.io_cancel.clone(), idle);
            let payload = match recv_payload(&ctx, &conn, &self.tracker).await {
                Ok(payload) => payload,
                Err(e) if e.is_desynced() => {
                    tracing::warn!(client_id = %client_id, error = %e, "Unframeable input, dropping client");
                    break;
                }
                Err(HostError::Protocol(e)) => {
                    tracing::warn!(client_id = %client_id, error = %e, "Skipping undecodable frame");
                    continue;
                }
                Err(HostError::Cancelled) => return,
                Err(HostError::DeadlineExceeded) => {
                    tracing::info!(client_id = %client_id, idle_secs = idle.as_secs(), "Client went silent");
                    break;
                }
                Err(e) => {
                    tracing::debug!(client_id = %client_id, error = %e, "Client read loop ended");
                    break;
                }
            };

            match payload.content {
                Content::Heartbeat(hb) => {
                    tracing::trace!(client_id = %client_id, kind = ?hb.kind, "Heartbeat");
                }
                Content::Info(InfoMessage {
                    info_type: InfoType::Shutdown,
                    ..
                }) => {
                    self.client_left(client_id, &conn).await;
                    return;
                }
                other => {
                    tracing::debug!(client_id = %client_id, kind = other.kind(), "Ignoring frame");
                }
            }
        }

        self.drop_client(client_id, &conn).await;
    }

    async fn client_left(&self, client_id: ClientId, conn: &Connection) {
        self.pipeline.unsubscribe(conn.id()).await;
        let record = self.registry.remove(client_id).await;

        let ctx = OpContext::with_timeout(self.io_cancel.clone(), self.config.kick_timeout);
        let ack = Content::Info(InfoMessage::new(InfoType::ReqAck, "Goodbye"));
        if let Err(e) = send_payload(&ctx, conn, &self.tracker, Header::Info, ack).await {
            tracing::debug!(client_id = %client_id, error = %e, "Failed to acknowledge leave");
        }
        conn.close().await;

        if let Some(record) = record {
            tracing::info!(client_id = %client_id, username = %record.name, "Client left");
        }
    }

    async fn drop_client(&self, client_id: ClientId, conn: &Connection) {
        self.pipeline.unsubscribe(conn.id()).await;
        if let Some(record) = self.registry.remove(client_id).await {
            tracing::info!(client_id = %client_id, username = %record.name, "Client removed");
        }
        conn.close().await;
    }

    /// Sends a best-effort ERROR frame and closes.
    async fn kick(&self, conn: &Connection, code: ErrorCode, message: &str, detail: &str) {
        let ctx = OpContext::with_timeout(self.io_cancel.clone(), self.config.kick_timeout);
        let content = Content::Error(ErrorMessage::new(code, message, detail));
        if let Err(e) = send_payload(&ctx, conn, &self.tracker, Header::Error, content).await {
            tracing::debug!(peer = %conn.peer(), error = %e, "Failed to send refusal");
        }
        conn.close().await;
    }

    async fn rotation_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.rotation_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.accept_stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match fresh_secret(Arc::clone(&self.authority)).await {
                Ok(secret) => {
                    tracing::info!(passphrase = %secret.passphrase, "Passphrase rotated");
                    self.secret.send_replace(secret);
                }
                Err(e) => tracing::warn!(error = %e, "Passphrase rotation failed"),
            }
        }
    }

    async fn wait_quiescent(&self, deadline: Instant) -> bool {
        let cap = Instant::now() + QUIESCE_ROUND * QUIESCE_POLLS;
        let until = cap.min(deadline);
        let mut polls = 0u32;

        while self.tracker.any_action_in_progress() {
            let now = Instant::now();
            if now >= until {
                return false;
            }
            polls += 1;
            if polls % 20 == 1 {
                tracing::debug!(
                    reads = self.tracker.reads(),
                    writes = self.tracker.writes(),
                    "Waiting for in-flight operations"
                );
            }
            tokio::time::sleep(QUIESCE_POLL_INTERVAL.min(until - now)).await;
        }
        true
    }

    /// Unsubscribes, notifies and closes every viewer concurrently.
    async fn notify_shutdown(&self) -> usize {
        let records = self.registry.close().await;
        let mut set = JoinSet::new();

        for record in records {
            let Some(conn) = record.connection else {
                continue;
            };

            let client_id = record.id;
            let pipeline = Arc::clone(&self.pipeline);
            let tracker = Arc::clone(&self.tracker);
            let timeout = self.config.kick_timeout;
            set.spawn(async move {
                pipeline.unsubscribe(conn.id()).await;
                let ctx = OpContext::with_timeout(CancellationToken::new(), timeout);
                let notice = Content::Info(InfoMessage::new(InfoType::Shutdown, "Session ended"));
                let sent = send_payload(&ctx, &conn, &tracker, Header::Info, notice).await;
                if let Err(e) = &sent {
                    tracing::debug!(client_id = %client_id, error = %e, "Failed to notify client");
                }
                conn.close().await;
                sent.is_ok()
            });
        }

        let mut notified = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => notified += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Notify task failed"),
            }
        }
        notified
    }
}
