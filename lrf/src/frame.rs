//! Chunk payload framing: `length (4B BE) | codec id (1B) | encoded payload` (spec
//! §3, §6). The length prefix is big-endian while every header field is
//! little-endian — intentional, per spec §9, for compatibility with existing LRF
//! tooling.

use byteorder::{BigEndian, ByteOrder};

use crate::codec::CompressionId;
use crate::constants::{FRAME_HEADER_LEN, MAX_CHUNK_BYTES};
use crate::error::FormatError;

/// A parsed chunk frame borrowed from a buffer returned by a reader.
pub struct Frame<'a> {
    pub codec: u8,
    pub payload: &'a [u8],
}

/// Build an on-disk frame for an already-encoded payload. `codec` is the identifier
/// actually used for this chunk, which may differ from the region's default if
/// encoding fell back to identity (spec §4.1, §4.5).
pub fn build(codec: CompressionId, encoded: &[u8]) -> Vec<u8> {
    let total_len = FRAME_HEADER_LEN + encoded.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u32).to_be_bytes());
    out.push(codec.as_u8());
    out.extend_from_slice(encoded);
    out
}

/// Parse a frame out of `bytes`, which must be exactly the `size` bytes read from the
/// region file at the chunk's offset (spec §4.4 steps 4-5).
pub fn parse(bytes: &[u8]) -> Result<Frame<'_>, FormatError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(FormatError::FrameTooShort);
    }
    let total_len = BigEndian::read_u32(&bytes[0..4]) as usize;
    if total_len < FRAME_HEADER_LEN || total_len > bytes.len() || total_len > MAX_CHUNK_BYTES {
        return Err(FormatError::FrameLengthOutOfRange);
    }
    let codec = bytes[4];
    let payload = &bytes[FRAME_HEADER_LEN..total_len];
    Ok(Frame { codec, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_roundtrips() {
        let encoded = b"hello region".to_vec();
        let framed = build(CompressionId::Lz4, &encoded);
        assert_eq!(&framed[0..4], &((5 + encoded.len()) as u32).to_be_bytes());
        assert_eq!(framed[4], CompressionId::Lz4.as_u8());

        let parsed = parse(&framed).unwrap();
        assert_eq!(parsed.codec, CompressionId::Lz4.as_u8());
        assert_eq!(parsed.payload, &encoded[..]);
    }

    #[test]
    fn rejects_short_frame() {
        assert_eq!(parse(&[0, 0, 0]).unwrap_err(), FormatError::FrameTooShort);
    }

    #[test]
    fn rejects_length_out_of_range() {
        // Declares a length greater than the bytes actually supplied.
        let mut bytes = vec![0u8; 10];
        BigEndian::write_u32(&mut bytes[0..4], 9999);
        assert_eq!(parse(&bytes).unwrap_err(), FormatError::FrameLengthOutOfRange);
    }

    #[test]
    fn rejects_length_below_header() {
        let mut bytes = vec![0u8; 10];
        BigEndian::write_u32(&mut bytes[0..4], 3);
        assert_eq!(parse(&bytes).unwrap_err(), FormatError::FrameLengthOutOfRange);
    }
}
