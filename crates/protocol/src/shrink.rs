//! Byte-shrinking codecs applied to terminal output before it is wrapped in
//! [`TerminalContent`](crate::messages::TerminalContent).
//!
//! The host shrinks, the viewer expands. Both sides must agree on the codec
//! out of band (it is a session setting, not negotiated on the wire).

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::framing::MAX_PAYLOAD_SIZE;

/// Largest expanded size [`Lz4::expand`] will allocate for.
pub const MAX_EXPANDED_SIZE: usize = MAX_PAYLOAD_SIZE * 16;

/// A reversible byte transform.
pub trait Shrink: Send + Sync {
    /// Transforms raw terminal bytes into their wire form.
    fn shrink(&self, raw: &[u8]) -> Vec<u8>;

    /// Restores raw terminal bytes from their wire form.
    fn expand(&self, shrunk: &[u8]) -> Result<Vec<u8>>;
}

/// Leaves bytes untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Shrink for Passthrough {
    fn shrink(&self, raw: &[u8]) -> Vec<u8> {
        raw.to_vec()
    }

    fn expand(&self, shrunk: &[u8]) -> Result<Vec<u8>> {
        Ok(shrunk.to_vec())
    }
}

/// LZ4 block compression with the uncompressed size prepended.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4;

impl Shrink for Lz4 {
    fn shrink(&self, raw: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(raw)
    }

    /// Refuses a declared size above [`MAX_EXPANDED_SIZE`] before
    /// allocating anything.
    fn expand(&self, shrunk: &[u8]) -> Result<Vec<u8>> {
        let Some(prefix) = shrunk.get(..4) else {
            return Err(ProtocolError::Shrink("missing size prefix".to_string()));
        };
        let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if declared > MAX_EXPANDED_SIZE {
            return Err(ProtocolError::Shrink(format!(
                "declared size {} exceeds {}",
                declared, MAX_EXPANDED_SIZE
            )));
        }
        Ok(lz4_flex::decompress_size_prepended(shrunk)?)
    }
}

/// Codec selector as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShrinkKind {
    /// [`Passthrough`].
    #[default]
    None,
    /// [`Lz4`].
    Lz4,
}

impl ShrinkKind {
    /// Returns the codec for this kind.
    pub fn codec(self) -> Box<dyn Shrink> {
        match self {
            ShrinkKind::None => Box::new(Passthrough),
            ShrinkKind::Lz4 => Box::new(Lz4),
        }
    }
}
