//! Payload envelope and content definitions.
//!
//! Every frame on the wire carries exactly one [`Payload`]: a version, a
//! [`Header`], a timestamp and a single [`Content`] variant. The header and
//! the content variant must agree; [`encode_payload`] and [`decode_payload`]
//! both enforce the pairing through [`Header::accepts`]. Payloads are
//! serialized with MessagePack.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::framing::MAX_PAYLOAD_SIZE;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header announcing what kind of content a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Header {
    /// Authentication exchange.
    Auth,
    /// Informational notice.
    Info,
    /// Error report.
    Error,
    /// Liveness ping or pong.
    Heartbeat,
    /// Shell output.
    TerminalData,
}

impl Header {
    /// Every header, in wire order.
    pub const ALL: [Header; 5] = [
        Header::Auth,
        Header::Info,
        Header::Error,
        Header::Heartbeat,
        Header::TerminalData,
    ];

    /// Returns whether `content` is the variant this header carries.
    ///
    /// This is the single source of truth for header/content pairing.
    pub fn accepts(self, content: &Content) -> bool {
        matches!(
            (self, content),
            (Header::Auth, Content::Auth(_))
                | (Header::Info, Content::Info(_))
                | (Header::Error, Content::Error(_))
                | (Header::Heartbeat, Content::Heartbeat(_))
                | (Header::TerminalData, Content::Terminal(_))
        )
    }
}

/// The content of a payload. Exactly one variant is ever populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    /// Authentication request or response.
    Auth(AuthMessage),
    /// Informational notice.
    Info(InfoMessage),
    /// Error report.
    Error(ErrorMessage),
    /// Liveness ping or pong.
    Heartbeat(HeartbeatMessage),
    /// A chunk of terminal output.
    Terminal(TerminalContent),
}

impl Content {
    /// Short variant name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Content::Auth(_) => "auth",
            Content::Info(_) => "info",
            Content::Error(_) => "error",
            Content::Heartbeat(_) => "heartbeat",
            Content::Terminal(_) => "terminal",
        }
    }
}

/// Versioned envelope for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// What the content is.
    pub header: Header,
    /// Seconds since the Unix epoch at encode time.
    pub timestamp: u64,
    /// The content selected by `header`.
    pub content: Content,
}

impl Payload {
    /// Builds a payload stamped with the current version and time.
    ///
    /// Fails with [`ProtocolError::HeaderMismatch`] if the content does not
    /// belong to `header`.
    pub fn new(header: Header, content: Content) -> Result<Self> {
        if !header.accepts(&content) {
            return Err(ProtocolError::HeaderMismatch {
                header,
                content: content.kind(),
            });
        }

        Ok(Self {
            version: PROTOCOL_VERSION,
            header,
            timestamp: unix_now(),
            content,
        })
    }

    /// Serializes the payload to MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        let bytes = rmp_serde::to_vec_named(self)?;
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserializes a payload from MessagePack without validating it.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Validates the header/content pairing, wraps the content in a fresh
/// [`Payload`] and serializes it.
///
/// A mismatch is a hard error: no bytes are produced.
pub fn encode_payload(header: Header, content: Content) -> Result<Vec<u8>> {
    Payload::new(header, content)?.to_msgpack()
}

/// Deserializes and validates a payload received from the wire.
///
/// Empty input, oversized input, an unknown version and a header that does
/// not match its content are all reported as errors.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyPayload);
    }
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let payload = Payload::from_msgpack(bytes)?;

    if payload.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            got: payload.version,
            expected: PROTOCOL_VERSION,
        });
    }
    if !payload.header.accepts(&payload.content) {
        return Err(ProtocolError::HeaderMismatch {
            header: payload.header,
            content: payload.content.kind(),
        });
    }

    Ok(payload)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Authentication
// ============================================================================

/// Authentication exchange between the session and a connecting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMessage {
    /// Sent by the session: "identify yourself".
    Request,
    /// Sent by the client in answer to a request.
    Response {
        /// Display name the client wants to join under.
        username: String,
        /// Passphrase the operator shared with the client.
        passphrase: String,
    },
}

impl AuthMessage {
    /// Builds a response carrying the client's credentials.
    pub fn response(username: impl Into<String>, passphrase: impl Into<String>) -> Self {
        AuthMessage::Response {
            username: username.into(),
            passphrase: passphrase.into(),
        }
    }
}

// ============================================================================
// Info
// ============================================================================

/// Kind of informational notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoType {
    /// The client passed authentication and joined the session.
    AuthSuccess,
    /// The sender is shutting down (session-wide from the server, or the
    /// client leaving).
    Shutdown,
    /// Acknowledges a client request.
    ReqAck,
}

/// Informational notice with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMessage {
    /// What is being announced.
    pub info_type: InfoType,
    /// Human-readable text.
    pub message: String,
}

impl InfoMessage {
    /// Creates a new info message.
    pub fn new(info_type: InfoType, message: impl Into<String>) -> Self {
        Self {
            info_type,
            message: message.into(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No more specific code applies.
    Unspecified,
    /// The session is at capacity.
    ServerFull,
    /// The client did not authenticate within the allowed attempts.
    AuthFailed,
    /// The last passphrase was wrong; another attempt follows.
    WrongPassphrase,
    /// A frame could not be decoded or was not expected.
    InvalidPayload,
    /// The session is going away.
    ServerShutdown,
}

/// Error report sent before a connection is refused or closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code.
    pub code: ErrorCode,
    /// Short machine-oriented message, e.g. `server_full`.
    pub message: String,
    /// Human-readable detail.
    pub detail: String,
}

impl ErrorMessage {
    /// Creates a new error message.
    pub fn new(code: ErrorCode, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Direction of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatKind {
    /// Liveness ping.
    Ping,
    /// Answer to a ping.
    Pong,
}

/// Liveness message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Ping or pong.
    pub kind: HeartbeatKind,
    /// Free-form note.
    pub note: String,
}

impl HeartbeatMessage {
    /// A ping.
    pub fn ping() -> Self {
        Self {
            kind: HeartbeatKind::Ping,
            note: "ping".to_string(),
        }
    }

    /// A pong.
    pub fn pong() -> Self {
        Self {
            kind: HeartbeatKind::Pong,
            note: "pong".to_string(),
        }
    }
}

// ============================================================================
// Terminal data
// ============================================================================

/// A chunk of terminal output with integrity metadata.
///
/// `length` and `checksum` let the receiver detect truncation and corruption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalContent {
    /// Unique identifier of this chunk.
    pub message_id: String,
    /// Declared byte count of `data`.
    pub length: u32,
    /// The (possibly shrunk) terminal bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// CRC-32C over `data`.
    pub checksum: u32,
}

impl TerminalContent {
    /// Wraps `data`, computing its length and checksum.
    pub fn new(message_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            length: data.len() as u32,
            checksum: crc32c::crc32c(&data),
            data,
        }
    }

    /// Checks the declared length and checksum against the carried bytes.
    pub fn verify(&self) -> Result<()> {
        if self.data.len() != self.length as usize {
            return Err(ProtocolError::LengthMismatch {
                declared: self.length,
                actual: self.data.len(),
            });
        }

        let computed = crc32c::crc32c(&self.data);
        if computed != self.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: self.checksum,
                computed,
            });
        }

        Ok(())
    }
}
