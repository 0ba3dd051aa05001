//! Per-connection payload compression.
//!
//! Compression is negotiated once per connection: the client's Hello frame
//! carries a bitmask of the algorithms it offers, the server answers with
//! the single algorithm it picked (or zero for none), and both sides then
//! compress payload-bearing frames with it. The factory is
//! multi-algorithm so new codecs can be added without a protocol change;
//! LZ4 is the only algorithm currently shipped.

use std::rc::Rc;

use crate::wire::WireError;

/// A compression algorithm with a stable negotiation bit.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// LZ4 block compression with a length prefix.
    Lz4 = 1,
}

impl CompressionAlgorithm {
    /// The negotiation mask bit for this algorithm.
    pub const fn bit(self) -> u32 {
        self as u32
    }
}

/// Stateless compressor for one negotiated algorithm.
pub trait Compressor {
    /// Compress a payload.
    fn compress(&self, payload: &[u8]) -> Vec<u8>;

    /// Decompress a payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Decompression`] on malformed input.
    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, WireError>;
}

struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, payload: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress_prepend_size(payload)
    }

    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, WireError> {
        lz4_flex::block::decompress_size_prepended(payload).map_err(|e| {
            WireError::Decompression {
                message: e.to_string(),
            }
        })
    }
}

/// Multi-algorithm compressor factory.
///
/// Holds the algorithms this node supports, in preference order, and
/// resolves a negotiation mask to a concrete [`Compressor`].
#[derive(Debug, Clone)]
pub struct CompressorFactory {
    algorithms: Vec<CompressionAlgorithm>,
}

impl CompressorFactory {
    /// Factory supporting every shipped algorithm.
    pub fn new() -> Self {
        Self {
            algorithms: vec![CompressionAlgorithm::Lz4],
        }
    }

    /// The negotiation mask of all supported algorithms.
    pub fn supported_mask(&self) -> u32 {
        self.algorithms.iter().map(|a| a.bit()).fold(0, |m, b| m | b)
    }

    /// Pick the preferred algorithm out of an offered mask.
    pub fn negotiate(&self, offered: u32) -> Option<CompressionAlgorithm> {
        self.algorithms
            .iter()
            .copied()
            .find(|a| offered & a.bit() != 0)
    }

    /// Instantiate the compressor for an algorithm.
    pub fn make(&self, algorithm: CompressionAlgorithm) -> Rc<dyn Compressor> {
        match algorithm {
            CompressionAlgorithm::Lz4 => Rc::new(Lz4Compressor),
        }
    }
}

impl Default for CompressorFactory {
    fn default() -> Self {
        Self::new()
    }
}
