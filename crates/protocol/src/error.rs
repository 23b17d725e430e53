//! Error types for the protocol crate.

use thiserror::Error;

use crate::messages::Header;

/// Protocol error type covering every way a payload or frame can be rejected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize a payload.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a payload.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Nothing to decode.
    #[error("cannot decode an empty payload")]
    EmptyPayload,

    // Envelope errors
    /// The content variant does not belong to the declared header.
    #[error("header {header:?} does not accept {content} content")]
    HeaderMismatch {
        /// Header the caller declared.
        header: Header,
        /// Name of the content variant that was supplied.
        content: &'static str,
    },

    /// The peer speaks a protocol version we do not understand.
    #[error("unsupported protocol version {got}, expected {expected}")]
    UnsupportedVersion {
        /// Version carried by the payload.
        got: u8,
        /// Version this build speaks.
        expected: u8,
    },

    // Frame errors
    /// Payload or declared frame length exceeds the maximum allowed size.
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual or declared size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Not enough bytes to hold the frame the header announced.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    // Terminal content errors
    /// Declared terminal length differs from the carried byte count.
    #[error("terminal content length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length the sender declared.
        declared: u32,
        /// Bytes actually carried.
        actual: usize,
    },

    /// Checksum over the terminal bytes does not match.
    #[error("terminal content checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum the sender declared.
        expected: u32,
        /// Checksum computed locally.
        computed: u32,
    },

    /// The shrink codec could not restore the original bytes.
    #[error("shrink codec failed: {0}")]
    Shrink(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for ProtocolError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        ProtocolError::Shrink(err.to_string())
    }
}
