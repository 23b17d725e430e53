//! Length-prefixed framing.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: serialized [`Payload`](crate::messages::Payload)
//!
//! A declared length above [`MAX_PAYLOAD_SIZE`] is a protocol violation. The
//! same bound is enforced when a payload is encoded, so anything this crate
//! produces can always be read back.

use crate::error::{ProtocolError, Result};

/// Maximum serialized payload size (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Frame header size: the 4-byte length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Validates a frame header and returns the payload length it declares.
///
/// Readers call this before allocating the payload buffer.
pub fn parse_length(header: [u8; FRAME_HEADER_SIZE]) -> Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(len)
}

/// Builds the length prefix for a payload of `len` bytes.
pub fn length_prefix(len: usize) -> Result<[u8; FRAME_HEADER_SIZE]> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok((len as u32).to_be_bytes())
}

/// Encoder and decoder for whole frames held in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a payload into a frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let prefix = length_prefix(payload.len())?;

        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        output.extend_from_slice(&prefix);
        output.extend_from_slice(payload);
        Ok(output)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns the payload and the number of bytes consumed.
    pub fn decode<'a>(&self, data: &'a [u8]) -> Result<(&'a [u8], usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => {
                let needed = match header_of(data) {
                    Some(header) => FRAME_HEADER_SIZE + parse_length(header)?,
                    None => FRAME_HEADER_SIZE,
                };
                Err(ProtocolError::Truncated {
                    needed,
                    available: data.len(),
                })
            }
        }
    }

    /// Try to decode a frame, returning `None` if `data` holds only part of it.
    ///
    /// An oversized declared length is an error even before the payload
    /// bytes arrive.
    pub fn try_decode<'a>(&self, data: &'a [u8]) -> Result<Option<(&'a [u8], usize)>> {
        let Some(header) = header_of(data) else {
            return Ok(None);
        };

        let len = parse_length(header)?;
        let total = FRAME_HEADER_SIZE + len;
        if data.len() < total {
            return Ok(None);
        }

        Ok(Some((&data[FRAME_HEADER_SIZE..total], total)))
    }
}

fn header_of(data: &[u8]) -> Option<[u8; FRAME_HEADER_SIZE]> {
    data.get(..FRAME_HEADER_SIZE)?.try_into().ok()
}
