//! # termrelay Protocol Library
//!
//! Wire definitions shared by the termrelay host and its viewers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Payload {version, header, content}    │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │      TerminalContent (CRC-32C)          │  optional shrink codec
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  4-byte big-endian length
//! ├─────────────────────────────────────────┤
//! │                 TCP                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_payload, encode_payload, Content, FrameCodec, Header, TerminalContent};
//!
//! let chunk = TerminalContent::new("chunk-1", b"$ ls\r\n".to_vec());
//! let bytes = encode_payload(Header::TerminalData, Content::Terminal(chunk)).unwrap();
//!
//! let frame = FrameCodec::new().encode(&bytes).unwrap();
//! let (body, _) = FrameCodec::new().decode(&frame).unwrap();
//!
//! let payload = decode_payload(body).unwrap();
//! assert_eq!(payload.header, Header::TerminalData);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Payload envelope and content variants
//! - [`framing`]: Length-prefixed frames
//! - [`shrink`]: Terminal byte codecs
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;
pub mod shrink;

pub use error::{ProtocolError, Result};
pub use framing::{length_prefix, parse_length, FrameCodec, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use messages::{
    decode_payload, encode_payload, AuthMessage, Content, ErrorCode, ErrorMessage, Header,
    HeartbeatKind, HeartbeatMessage, InfoMessage, InfoType, Payload, TerminalContent,
    PROTOCOL_VERSION,
};
pub use shrink::{Lz4, Passthrough, Shrink, ShrinkKind, MAX_EXPANDED_SIZE};
