//! Viewer side of a session: connects, authenticates and yields the
//! operator's terminal output.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use protocol::{
    AuthMessage, Content, ErrorCode, ErrorMessage, Header, HeartbeatMessage, InfoMessage,
    InfoType, Shrink, ShrinkKind,
};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{HostError, Result};
use crate::io::{recv_payload, send_payload, OpContext, Tracker};

/// Bound on each write the viewer makes.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that arrived from the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Verified and expanded terminal bytes.
    Output(Vec<u8>),
    /// An informational notice.
    Notice(InfoMessage),
    /// An error report that did not end the connection by itself.
    Error(ErrorMessage),
    /// A heartbeat from the session.
    Heartbeat(HeartbeatMessage),
    /// The session announced it is going away.
    Ended(String),
}

/// A connected viewer.
pub struct Viewer {
    conn: Arc<Connection>,
    tracker: Arc<Tracker>,
    shrink: Box<dyn Shrink>,
    cancel: CancellationToken,
    pending: VecDeque<ViewerEvent>,
    name: String,
}

impl Viewer {
    /// Connects to a session. `shrink` must match the session's codec.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        name: impl Into<String>,
        shrink: ShrinkKind,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let conn = Arc::new(Connection::from_tcp(stream));
        tracing::debug!(peer = %conn.peer(), "Connected to session");

        Ok(Self {
            conn,
            tracker: Tracker::new(),
            shrink: shrink.codec(),
            cancel: CancellationToken::new(),
            pending: VecDeque::new(),
            name: name.into(),
        })
    }

    /// The name this viewer joins under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Answers auth requests with `passphrase` until the session admits or
    /// refuses us. Each wait is bounded by `timeout`.
    ///
    /// Terminal output that arrives before the admission notice is kept and
    /// returned by later calls to [`Viewer::next_event`].
    pub async fn authenticate(&mut self, passphrase: &str, timeout: Duration) -> Result<()> {
        loop {
            let ctx = OpContext::with_timeout(self.cancel.clone(), timeout);
            let payload = recv_payload(&ctx, &self.conn, &self.tracker).await?;

            match payload.content {
                Content::Auth(AuthMessage::Request) => {
                    let response = Content::Auth(AuthMessage::response(self.name.clone(), passphrase));
                    self.send(Header::Auth, response).await?;
                }
                Content::Info(InfoMessage {
                    info_type: InfoType::AuthSuccess,
                    message,
                }) => {
                    tracing::info!(message = %message, "Admitted to session");
                    return Ok(());
                }
                Content::Info(InfoMessage {
                    info_type: InfoType::Shutdown,
                    message,
                }) => {
                    self.conn.close().await;
                    return Err(HostError::Rejected {
                        code: ErrorCode::ServerShutdown,
                        detail: message,
                    });
                }
                Content::Error(err) if err.code == ErrorCode::WrongPassphrase => {
                    tracing::warn!(detail = %err.detail, "Passphrase rejected");
                }
                Content::Error(err) => {
                    self.conn.close().await;
                    return Err(HostError::Rejected {
                        code: err.code,
                        detail: err.detail,
                    });
                }
                Content::Terminal(chunk) => {
                    let event = self.translate(Content::Terminal(chunk))?;
                    self.pending.extend(event);
                }
                other => {
                    tracing::debug!(kind = other.kind(), "Ignoring frame during authentication");
                }
            }
        }
    }

    /// Waits for the next event, at most `timeout` when given.
    pub async fn next_event(&mut self, timeout: Option<Duration>) -> Result<ViewerEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }

        loop {
            let ctx = match timeout {
                Some(t) => OpContext::with_timeout(self.cancel.clone(), t),
                None => OpContext::new(self.cancel.clone()),
            };
            let payload = recv_payload(&ctx, &self.conn, &self.tracker).await?;
            if let Some(event) = self.translate(payload.content)? {
                return Ok(event);
            }
        }
    }

    /// Sends one heartbeat.
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.send(Header::Heartbeat, Content::Heartbeat(HeartbeatMessage::ping()))
            .await
    }

    /// Sends heartbeats every `interval` until the connection closes.
    pub fn spawn_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let conn = Arc::clone(&self.conn);
        let tracker = Arc::clone(&self.tracker);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = conn.closed() => break,
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let ctx = OpContext::with_timeout(cancel.clone(), WRITE_TIMEOUT);
                let ping = Content::Heartbeat(HeartbeatMessage::ping());
                if let Err(e) = send_payload(&ctx, &conn, &tracker, Header::Heartbeat, ping).await {
                    tracing::debug!(error = %e, "Heartbeat failed");
                    break;
                }
            }
        })
    }

    /// Announces we are leaving, waits up to `timeout` for the
    /// acknowledgement and closes. Returns whether it was acknowledged.
    pub async fn leave(&mut self, timeout: Duration) -> Result<bool> {
        let notice = Content::Info(InfoMessage::new(InfoType::Shutdown, "leaving"));
        self.send(Header::Info, notice).await?;

        let ctx = OpContext::with_timeout(self.cancel.clone(), timeout);
        let mut acknowledged = false;
        loop {
            match recv_payload(&ctx, &self.conn, &self.tracker).await {
                Ok(payload) => {
                    if let Content::Info(InfoMessage {
                        info_type: InfoType::ReqAck,
                        ..
                    }) = payload.content
                    {
                        acknowledged = true;
                        break;
                    }
                }
                Err(HostError::Protocol(_)) => continue,
                Err(_) => break,
            }
        }

        self.close().await;
        Ok(acknowledged)
    }

    /// Closes the connection and stops any heartbeat task.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.conn.close().await;
    }

    async fn send(&self, header: Header, content: Content) -> Result<()> {
        let ctx = OpContext::with_timeout(self.cancel.clone(), WRITE_TIMEOUT);
        send_payload(&ctx, &self.conn, &self.tracker, header, content).await
    }

    fn translate(&self, content: Content) -> Result<Option<ViewerEvent>> {
        let event = match content {
            Content::Terminal(chunk) => {
                chunk.verify()?;
                ViewerEvent::Output(self.shrink.expand(&chunk.data)?)
            }
            Content::Info(InfoMessage {
                info_type: InfoType::Shutdown,
                message,
            }) => ViewerEvent::Ended(message),
            Content::Info(info) => ViewerEvent::Notice(info),
            Content::Error(err) => ViewerEvent::Error(err),
            Content::Heartbeat(hb) => ViewerEvent::Heartbeat(hb),
            Content::Auth(_) => return Ok(None),
        };
        Ok(Some(event))
    }
}

impl std::fmt::Debug for Viewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewer")
            .field("name", &self.name)
            .field("conn", &self.conn)
            .field("pending", &self.pending.len())
            .finish()
    }
}
