//! Codec registry: maps a compression identifier to an encoder/decoder pair.
//!
//! Stateless and deterministic, per spec §4.1. Identifier 0 is the identity codec.
//! Unknown identifiers fail with [`CodecError::UnsupportedCodec`]. Writers never see
//! an encode failure propagate: they fall back to identity and record the identifier
//! they actually used in the per-chunk frame (see [`crate::writer`]).

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression as ZlibLevel;

use crate::error::CodecError;

/// Compression identifiers, as stored in the per-chunk frame and the header's
/// region-level default (spec §3, §6).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionId {
    #[default]
    None = 0,
    Zlib = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl CompressionId {
    /// Parse a raw identifier byte, returning `None` for anything not in the table.
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Zlib),
            2 => Some(Self::Lz4),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Stateless encode/decode entry point. Kept as a unit struct (rather than a trait
/// object registry) because the identifier set is closed and small; adding a codec
/// means adding a match arm, not registering a new implementation at runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodecRegistry;

impl CodecRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Encode `bytes` with the given codec. Deterministic over identical input.
    pub fn encode(&self, id: CompressionId, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        match id {
            CompressionId::None => Ok(bytes.to_vec()),
            CompressionId::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::new(), ZlibLevel::default());
                enc.write_all(bytes).map_err(|_| CodecError::EncodeFailed)?;
                enc.finish().map_err(|_| CodecError::EncodeFailed)
            }
            CompressionId::Lz4 => Ok(lz4_flex::block::compress_prepend_size(bytes)),
            CompressionId::Zstd => {
                zstd::bulk::compress(bytes, 0).map_err(|_| CodecError::EncodeFailed)
            }
        }
    }

    /// Decode `bytes` previously produced by [`Self::encode`] with the same `id`.
    pub fn decode(&self, id: CompressionId, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        match id {
            CompressionId::None => Ok(bytes.to_vec()),
            CompressionId::Zlib => {
                let mut dec = ZlibDecoder::new(bytes);
                let mut out = Vec::new();
                dec.read_to_end(&mut out).map_err(|_| CodecError::DecodeFailed)?;
                Ok(out)
            }
            CompressionId::Lz4 => lz4_flex::block::decompress_size_prepended(bytes)
                .map_err(|_| CodecError::DecodeFailed),
            CompressionId::Zstd => {
                zstd::bulk::decompress(bytes, crate::constants::MAX_CHUNK_BYTES)
                    .map_err(|_| CodecError::DecodeFailed)
            }
        }
    }

    /// Decode using a raw identifier byte, failing with `UnsupportedCodec` for values
    /// outside the known table (spec §4.1, §7).
    pub fn decode_raw(&self, raw_id: u8, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let id = CompressionId::from_u8(raw_id).ok_or(CodecError::UnsupportedCodec(raw_id))?;
        self.decode(id, bytes)
    }
}
