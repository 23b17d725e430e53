//! Authentication exchange run on every accepted connection before it is
//! admitted to the registry.

use std::sync::Arc;
use std::time::Duration;

use protocol::{
    AuthMessage, Content, ErrorCode, ErrorMessage, Header, InfoMessage, InfoType,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{HostError, Result};
use crate::io::{recv_payload, send_payload, OpContext, Tracker};
use crate::passphrase::{verify_async, PassphraseAuthority, Secret};

/// AUTH REQUEST / RESPONSE rounds allowed before a client is refused.
pub const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Everything a handshake needs, shared by all accepted connections.
#[derive(Clone)]
pub struct Handshake {
    pub(crate) authority: Arc<dyn PassphraseAuthority>,
    pub(crate) secret: watch::Receiver<Secret>,
    pub(crate) tracker: Arc<Tracker>,
    pub(crate) attempt_timeout: Duration,
    pub(crate) cancel: CancellationToken,
}

impl Handshake {
    /// Authenticates `conn` and returns the username it joined under.
    ///
    /// Each round sends AUTH REQUEST and waits up to `attempt_timeout` for a
    /// response. The passphrase is checked against the digest current at
    /// that moment, so a rotation mid-handshake applies to the next round.
    /// A wrong passphrase is reported with ERROR(WRONG_PASSPHRASE) and the
    /// next round begins. A silent round simply counts as spent.
    pub async fn run(&self, conn: &Connection) -> Result<String> {
        for attempt in 1..=MAX_AUTH_ATTEMPTS {
            let ctx = OpContext::with_timeout(self.cancel.clone(), self.attempt_timeout);

            send_payload(
                &ctx,
                conn,
                &self.tracker,
                Header::Auth,
                Content::Auth(AuthMessage::Request),
            )
            .await?;

            let payload = match recv_payload(&ctx, conn, &self.tracker).await {
                Ok(payload) => payload,
                Err(HostError::DeadlineExceeded) | Err(HostError::Timeout) => {
                    tracing::debug!(conn_id = conn.id(), attempt, "Auth attempt timed out");
                    continue;
                }
                Err(e) if e.is_desynced() => return Err(e),
                Err(HostError::Protocol(e)) => {
                    tracing::debug!(conn_id = conn.id(), attempt, error = %e, "Invalid auth frame");
                    self.report(conn, ErrorCode::InvalidPayload, "invalid_payload", &e.to_string())
                        .await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match payload.content {
                Content::Auth(AuthMessage::Response { username, passphrase }) => {
                    let digest = self.secret.borrow().digest.clone();
                    if verify_async(Arc::clone(&self.authority), digest, passphrase).await {
                        return Ok(username);
                    }
                    tracing::info!(
                        conn_id = conn.id(),
                        peer = %conn.peer(),
                        username = %username,
                        attempt,
                        "Wrong passphrase"
                    );
                    if attempt < MAX_AUTH_ATTEMPTS {
                        self.report(
                            conn,
                            ErrorCode::WrongPassphrase,
                            "wrong_passphrase",
                            "The passphrase was not accepted, try again",
                        )
                        .await;
                    }
                }
                Content::Info(InfoMessage {
                    info_type: InfoType::Shutdown,
                    ..
                }) => return Err(HostError::EarlyExit),
                other => return Err(HostError::UnexpectedFrame(other.kind())),
            }
        }

        Err(HostError::AuthExhausted {
            attempts: MAX_AUTH_ATTEMPTS,
        })
    }

    async fn report(&self, conn: &Connection, code: ErrorCode, message: &str, detail: &str) {
        let ctx = OpContext::with_timeout(self.cancel.clone(), self.attempt_timeout);
        let content = Content::Error(ErrorMessage::new(code, message, detail));
        if let Err(e) = send_payload(&ctx, conn, &self.tracker, Header::Error, content).await {
            tracing::debug!(conn_id = conn.id(), error = %e, "Failed to send handshake error");
        }
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}
