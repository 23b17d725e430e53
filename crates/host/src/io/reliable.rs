//! Framed writes with bounded retry, and framed reads that never return a
//! partial frame.

use std::sync::Arc;

use protocol::{decode_payload, encode_payload, Content, Header, Payload, FRAME_HEADER_SIZE};

use super::backoff::{self, MAX_ATTEMPTS, PER_TRY_TIMEOUT};
use super::{OpContext, Tracker};
use crate::connection::Connection;
use crate::error::{HostError, Result};

/// Writes `data` as one length-prefixed frame.
///
/// The connection's write half is held for the whole frame, retries
/// included, so frames from concurrent writers never interleave. Each
/// attempt is bounded by [`PER_TRY_TIMEOUT`] or the remaining time on
/// `ctx`, whichever is shorter. Retryable failures back off and resume from
/// the last byte that was accepted, so a frame is never duplicated on the
/// wire. A closed connection, a cancelled context and an expired context
/// return immediately.
///
/// A frame abandoned after some of its bytes went out leaves the peer
/// mid-frame, so the connection is closed rather than reused.
pub async fn write_full(
    ctx: &OpContext,
    conn: &Connection,
    tracker: &Arc<Tracker>,
    data: &[u8],
) -> Result<()> {
    let _guard = tracker.write_guard();

    let prefix = protocol::length_prefix(data.len())?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(data);

    check_open(ctx, conn)?;

    let mut written = 0usize;
    let result = write_frame(ctx, conn, &frame, &mut written).await;
    if result.is_err() && written > 0 && written < frame.len() {
        tracing::debug!(
            conn_id = conn.id(),
            written = written,
            total = frame.len(),
            "Frame cut off mid-write, closing connection"
        );
        conn.close().await;
    }
    result
}

async fn write_frame(
    ctx: &OpContext,
    conn: &Connection,
    frame: &[u8],
    written: &mut usize,
) -> Result<()> {
    let mut writer = match conn.lock_writer(ctx).await {
        Err(HostError::Timeout) => return Err(HostError::DeadlineExceeded),
        other => other?,
    };
    let mut attempt = 0u32;

    loop {
        check_open(ctx, conn)?;

        let attempt_ctx = ctx.child(PER_TRY_TIMEOUT);
        let err = match conn.write_from(&mut writer, &attempt_ctx, frame, written).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        attempt += 1;
        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= MAX_ATTEMPTS {
            return Err(HostError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let pause = backoff::delay(attempt - 1);
        tracing::debug!(
            conn_id = conn.id(),
            attempt = attempt,
            written = *written,
            total = frame.len(),
            error = %err,
            delay_ms = pause.as_millis() as u64,
            "Write attempt failed, retrying"
        );

        tokio::select! {
            biased;
            _ = ctx.token().cancelled() => return Err(HostError::Cancelled),
            _ = conn.closed() => return Err(HostError::Closed),
            _ = ctx.expired() => return Err(HostError::DeadlineExceeded),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Reads one length-prefixed frame and returns its body.
///
/// A declared length above the maximum payload size is rejected before
/// anything is allocated. If `ctx` is cancelled or expires mid-read, the
/// read is abandoned and the tracker is released before this returns.
pub async fn read_full(ctx: &OpContext, conn: &Connection, tracker: &Arc<Tracker>) -> Result<Vec<u8>> {
    let _guard = tracker.read_guard();

    check_open(ctx, conn)?;
    match conn.read_frame(ctx).await {
        Err(HostError::Timeout) if ctx.is_expired() => Err(HostError::DeadlineExceeded),
        other => other,
    }
}

/// Encodes one payload and writes it with [`write_full`].
pub async fn send_payload(
    ctx: &OpContext,
    conn: &Connection,
    tracker: &Arc<Tracker>,
    header: Header,
    content: Content,
) -> Result<()> {
    let bytes = encode_payload(header, content)?;
    write_full(ctx, conn, tracker, &bytes).await
}

/// Reads one frame with [`read_full`] and decodes it.
pub async fn recv_payload(ctx: &OpContext, conn: &Connection, tracker: &Arc<Tracker>) -> Result<Payload> {
    let body = read_full(ctx, conn, tracker).await?;
    Ok(decode_payload(&body)?)
}

fn check_open(ctx: &OpContext, conn: &Connection) -> Result<()> {
    if conn.is_closed() {
        return Err(HostError::Closed);
    }
    if ctx.is_cancelled() {
        return Err(HostError::Cancelled);
    }
    if ctx.is_expired() {
        return Err(HostError::DeadlineExceeded);
    }
    Ok(())
}
