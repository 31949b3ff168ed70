//! Error taxonomy for the LRF storage engine.
//!
//! Mirrors the categories a caller needs to distinguish: a malformed on-disk
//! container, a codec that refused to round-trip, an I/O failure the retry policy
//! already gave up on, a timeout, an integrity mismatch, or a cooperative
//! cancellation. Per-chunk failures inside a batch never abort the whole batch; see
//! [`crate::batch`].

use std::io;

use thiserror::Error;

/// Top-level error type returned by the public engine API.
#[derive(Debug, Error)]
pub enum LrfError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("operation was cancelled by the caller")]
    Cancelled,
    #[error("storage manager is shutting down")]
    ShuttingDown,
}

/// Malformed on-disk container. Never retried.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid region magic")]
    InvalidMagic,
    #[error("region file is smaller than the {0}-byte header")]
    FileTooSmall(usize),
    #[error("unsupported region version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid chunk count")]
    InvalidChunkCount,
    #[error("invalid offset-table slot for chunk index {0}")]
    InvalidSlotEntry(usize),
    #[error("chunk frame shorter than the minimum 5-byte envelope")]
    FrameTooShort,
    #[error("chunk frame length out of range")]
    FrameLengthOutOfRange,
}

/// Codec failures. `UnsupportedCodec` and `DecodeFailed` are fatal for the chunk
/// being processed; `EncodeFailed` is not (the writer falls back to identity).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported compression identifier {0}")]
    UnsupportedCodec(u8),
    #[error("encoding failed")]
    EncodeFailed,
    #[error("decoding failed")]
    DecodeFailed,
}

/// Integrity-validator outcomes that are errors rather than reports.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("primary checksum mismatch")]
    CorruptedPrimary,
    #[error("primary and backup checksums both mismatch")]
    CorruptedBoth,
    #[error("no checksum recorded for this chunk")]
    MissingChecksum,
}

/// Classification of a single chunk's integrity check, returned (not raised) by
/// [`crate::integrity::IntegrityValidator::validate_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityReport {
    Valid,
    CorruptedPrimary,
    CorruptedBoth,
    MissingChecksum,
}

/// Result alias used throughout the crate.
pub type LrfResult<T> = Result<T, LrfError>;
