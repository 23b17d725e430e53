//! Error types for the host.

use std::io;

use protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

use crate::pty::PtyError;

/// Errors raised by the session engine and its I/O primitives.
#[derive(Debug, Error)]
pub enum HostError {
    // Connection errors
    /// The peer closed the connection or it was closed locally.
    #[error("connection closed")]
    Closed,

    /// The peer reset the connection.
    #[error("connection reset: {0}")]
    Reset(String),

    /// A single attempt did not finish within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The caller's overall deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(io::Error),

    // Protocol errors
    /// A frame was malformed, oversized or carried the wrong content.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Auth errors
    /// The client used up every authentication attempt.
    #[error("authentication failed after {attempts} attempts")]
    AuthExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// The client announced it was leaving before authenticating.
    #[error("client left during authentication")]
    EarlyExit,

    /// The client sent something other than an auth response.
    #[error("unexpected {0} frame during handshake")]
    UnexpectedFrame(&'static str),

    /// The session refused us with an ERROR frame.
    #[error("rejected by session ({code:?}): {detail}")]
    Rejected {
        /// Code from the ERROR frame.
        code: ErrorCode,
        /// Human-readable detail.
        detail: String,
    },

    // Capacity errors
    /// The registry is full.
    #[error("session is full ({current}/{max})")]
    Capacity {
        /// Records currently held.
        current: usize,
        /// Configured maximum.
        max: usize,
    },

    // Shutdown errors
    /// The operation was interrupted by cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// Every retry failed.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: Box<HostError>,
    },

    /// The shell bridge failed.
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),

    /// Passphrase generation or hashing failed.
    #[error("passphrase error: {0}")]
    Passphrase(String),
}

impl HostError {
    /// Returns whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HostError::Timeout | HostError::Io(_))
    }

    /// Returns whether the inbound byte stream can no longer be framed.
    ///
    /// An oversized length prefix is refused before its body is read, so
    /// the next bytes on the wire are not a frame boundary.
    pub fn is_desynced(&self) -> bool {
        matches!(self, HostError::Protocol(ProtocolError::PayloadTooLarge { .. }))
    }

    /// Returns whether the connection is gone for good.
    pub fn is_closed(&self) -> bool {
        match self {
            HostError::Closed | HostError::Reset(_) => true,
            HostError::RetriesExhausted { last, .. } => last.is_closed(),
            _ => false,
        }
    }
}

impl From<io::Error> for HostError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => HostError::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => HostError::Closed,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                HostError::Reset(err.to_string())
            }
            _ => HostError::Io(err),
        }
    }
}

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_mapping() {
        let closed: HostError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(closed, HostError::Closed));
        assert!(closed.is_closed());

        let reset: HostError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(reset, HostError::Reset(_)));
        assert!(reset.is_closed());
        assert!(!reset.is_retryable());

        let timeout: HostError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(timeout.is_retryable());

        let other: HostError = io::Error::from(io::ErrorKind::Interrupted).into();
        assert!(matches!(other, HostError::Io(_)));
        assert!(other.is_retryable());
    }

    #[test]
    fn test_deadline_and_cancel_not_retryable() {
        assert!(!HostError::DeadlineExceeded.is_retryable());
        assert!(!HostError::Cancelled.is_retryable());
        assert!(!HostError::Closed.is_retryable());
    }

    #[test]
    fn test_oversized_frame_desyncs_stream() {
        let oversized = HostError::Protocol(ProtocolError::PayloadTooLarge {
            size: 70_000,
            max: 65_536,
        });
        assert!(oversized.is_desynced());
        assert!(!HostError::Protocol(ProtocolError::EmptyPayload).is_desynced());
        assert!(!HostError::Timeout.is_desynced());
    }

    #[test]
    fn test_retries_exhausted_keeps_closed_classification() {
        let err = HostError::RetriesExhausted {
            attempts: 5,
            last: Box::new(HostError::Closed),
        };
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "gave up after 5 attempts: connection closed");
    }

    #[test]
    fn test_capacity_display() {
        let err = HostError::Capacity { current: 9, max: 9 };
        assert_eq!(err.to_string(), "session is full (9/9)");
    }

    #[test]
    fn test_rejected_display() {
        let err = HostError::Rejected {
            code: ErrorCode::ServerFull,
            detail: "try later".to_string(),
        };
        assert_eq!(err.to_string(), "rejected by session (ServerFull): try later");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HostError>();
    }
}
