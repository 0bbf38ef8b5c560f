//! Stored Value Compression
//!
//! Optional LZ4 compression of values above a size threshold. Every stored
//! value carries a one-byte algorithm tag so compressed and raw values can
//! coexist in the same region, and toggling compression never invalidates
//! data already on disk.
//!
//! ```text
//! ┌─────┬──────────────────────────────┐
//! │ tag │ payload (raw or LZ4 block)   │
//! └─────┴──────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 block compression
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Tag byte written in front of each stored value
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    /// Resolve a tag byte
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Value compression settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compress values at or above `min_size_bytes`
    pub enabled: bool,
    /// Smaller values are stored uncompressed
    pub min_size_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 1024,
            level: 4,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(4)
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Value Codec
// =============================================================================

/// Encodes values for storage and decodes them on read.
pub struct ValueCodec {
    config: CompressionConfig,
    lz4: Lz4Compressor,
}

impl ValueCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            config,
        }
    }

    /// Tag and (when worthwhile) compress a value.
    ///
    /// Compression failures and non-shrinking results fall back to the raw
    /// value.
    pub fn encode(&self, value: &[u8]) -> Bytes {
        if self.config.enabled && value.len() >= self.config.min_size_bytes {
            match self.lz4.compress(value) {
                Ok(compressed) if compressed.len() < value.len() => {
                    return tagged(CompressionAlgorithm::Lz4, &compressed);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Compression failed, storing raw value: {}", e),
            }
        }
        tagged(CompressionAlgorithm::None, value)
    }

    /// Strip the tag and decompress a stored value.
    pub fn decode(&self, stored: &[u8]) -> Result<Bytes> {
        let (&tag, payload) = stored.split_first().ok_or_else(|| Error::DecompressionFailed {
            algorithm: "unknown".into(),
            reason: "empty stored value".into(),
        })?;

        match CompressionAlgorithm::from_tag(tag) {
            Some(CompressionAlgorithm::None) => Ok(Bytes::copy_from_slice(payload)),
            Some(CompressionAlgorithm::Lz4) => Ok(Bytes::from(self.lz4.decompress(payload)?)),
            None => Err(Error::DecompressionFailed {
                algorithm: "unknown".into(),
                reason: format!("unknown value tag {}", tag),
            }),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

fn tagged(algorithm: CompressionAlgorithm, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(algorithm.tag());
    buf.put_slice(payload);
    buf.freeze()
}
