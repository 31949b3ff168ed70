//! Corruption fixer: detects malformed regions and attempts best-effort recovery
//! (spec §4.11).
//!
//! `repair_chunk`'s heuristics are deliberately conservative: a region good
//! enough to still have most of its offset table intact should lose as few
//! chunks as possible, but nothing here is allowed to fabricate data.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use crate::codec::CodecRegistry;
use crate::constants::{self, CHUNKS_PER_REGION, HEADER_SIZE, MAGIC, MAX_CHUNK_BYTES};
use crate::frame;
use crate::header::{Header, Slot};

pub mod legacy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueCode {
    InvalidMagic,
    FileTooSmall,
    InvalidChunkCount,
    HeaderOverflow,
    NegativeLength,
    LengthTooLarge,
    InvalidOffset,
    DataTruncated,
}

#[derive(Debug, Default)]
pub struct DetectionReport {
    pub issues: Vec<(IssueCode, String)>,
}

impl DetectionReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validate a region file's structural integrity without attempting repair
/// (spec §4.11 `detectCorruption`).
pub fn detect_corruption(path: impl AsRef<Path>) -> std::io::Result<DetectionReport> {
    let path = path.as_ref();
    let mut report = DetectionReport::default();
    let bytes = fs::read(path)?;

    if bytes.len() < HEADER_SIZE {
        report.issues.push((IssueCode::FileTooSmall, format!("file is {} bytes, header needs {HEADER_SIZE}", bytes.len())));
        return Ok(report);
    }
    if &bytes[0..9] != MAGIC.as_slice() {
        report.issues.push((IssueCode::InvalidMagic, "magic bytes do not match TURBO_LRF".to_string()));
        return Ok(report);
    }

    let chunk_count = LittleEndian::read_u32(&bytes[13..17]);
    if chunk_count as usize > CHUNKS_PER_REGION {
        report.issues.push((IssueCode::InvalidChunkCount, format!("chunk_count {chunk_count} exceeds {CHUNKS_PER_REGION}")));
    }

    let file_len = bytes.len() as u64;
    for idx in 0..CHUNKS_PER_REGION {
        let off = 21 + idx * 4;
        let raw = LittleEndian::read_u32(&bytes[off..off + 4]);
        let slot = Slot::unpack(raw);
        if slot.is_empty() {
            continue;
        }
        let offset = slot.file_offset();
        let size = slot.size_sectors as u64 * constants::SIZE_UNIT;

        if offset < HEADER_SIZE as u64 {
            report.issues.push((IssueCode::HeaderOverflow, format!("chunk {idx} offset {offset} overlaps header")));
            continue;
        }
        if size == 0 {
            report.issues.push((IssueCode::NegativeLength, format!("chunk {idx} has zero-length size sector")));
            continue;
        }
        if size as usize > MAX_CHUNK_BYTES {
            report.issues.push((IssueCode::LengthTooLarge, format!("chunk {idx} size {size} exceeds max")));
            continue;
        }
        if offset >= file_len {
            report.issues.push((IssueCode::InvalidOffset, format!("chunk {idx} offset {offset} is beyond file end")));
            continue;
        }
        if offset + size > file_len {
            report.issues.push((IssueCode::DataTruncated, format!("chunk {idx} extends {} bytes past file end", offset + size - file_len)));
        }
    }

    Ok(report)
}

/// Rewrite `path` keeping only chunks whose slot is internally consistent,
/// after backing up the original (spec §4.11 `repairFile`).
///
/// Returns the number of chunks recovered.
pub fn repair_file(path: impl AsRef<Path>, now_suffix: &str) -> std::io::Result<usize> {
    let path = path.as_ref();
    backup_original(path, now_suffix)?;

    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_SIZE {
        return Ok(0);
    }

    let codec = CodecRegistry::new();
    let file_len = bytes.len() as u64;
    let mut recovered: Vec<(i32, i32, Vec<u8>)> = Vec::new();

    for idx in 0..CHUNKS_PER_REGION {
        let off = 21 + idx * 4;
        let raw = LittleEndian::read_u32(&bytes[off..off + 4]);
        let slot = Slot::unpack(raw);
        if slot.is_empty() {
            continue;
        }
        let offset = slot.file_offset();
        let size = slot.size_sectors as u64 * constants::SIZE_UNIT;
        if offset < HEADER_SIZE as u64 || size == 0 || size as usize > MAX_CHUNK_BYTES || offset + size > file_len {
            continue;
        }
        let frame_bytes = &bytes[offset as usize..(offset + size) as usize];
        let Ok(frame) = frame::parse(frame_bytes) else { continue };
        let Ok(payload) = codec.decode_raw(frame.codec, frame.payload) else { continue };

        let x = (idx % 32) as i32;
        let z = (idx / 32) as i32;
        recovered.push((x, z, payload));
    }

    warn!(path = %path.display(), recovered = recovered.len(), "rewriting region after corruption repair");

    let header = Header::empty(crate::codec::CompressionId::Zstd);
    let mut buf = vec![0u8; HEADER_SIZE];
    header.write(&mut buf);
    fs::write(path, &buf)?;

    let region = crate::resource::SharedRegion::open(path, crate::codec::CompressionId::Zstd)?;
    let mut writer = crate::writer::RegionWriter::new(region);
    for (x, z, data) in &recovered {
        writer.queue_chunk(*x, *z, data.clone());
    }
    writer
        .flush_batch()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    Ok(recovered.len())
}

fn backup_original(path: &Path, now_suffix: &str) -> std::io::Result<PathBuf> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let backup_dir = parent.join("corruption_backup");
    fs::create_dir_all(&backup_dir)?;
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("region");
    let backup_path = backup_dir.join(format!("{file_name}.{now_suffix}.bak"));
    fs::copy(path, &backup_path)?;
    Ok(backup_path)
}

/// Attempt to recover a single chunk's payload by heuristic, without touching
/// the rest of the region (spec §4.11 `repairChunk`). Each heuristic may be a
/// no-op; they run in sequence and the first success wins.
pub fn repair_chunk(path: impl AsRef<Path>, x: i32, z: i32, reason: IssueCode) -> std::io::Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    let mut file = fs::File::open(path)?;
    let file_len = file.metadata()?.len();
    let idx = constants::chunk_index(x, z);

    if let Some(payload) = try_alternate_sector_alignment(&mut file, file_len, idx)? {
        return Ok(Some(payload));
    }
    if let Some(payload) = try_pattern_scan(&mut file, file_len)? {
        return Ok(Some(payload));
    }
    if reason == IssueCode::DataTruncated {
        // Truncation heuristics would need a known expected length; nothing
        // further can be inferred without fabricating data.
        return Ok(None);
    }
    Ok(None)
}

/// Re-derive an offset from the header's raw slot value but reinterpret the
/// sector unit as 4096 instead of 256, in case the table was written by a tool
/// using a single alignment unit for both offset and size.
fn try_alternate_sector_alignment(file: &mut fs::File, file_len: u64, idx: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut header_buf = vec![0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header_buf)?;

    let off = 21 + idx * 4;
    let raw = LittleEndian::read_u32(&header_buf[off..off + 4]);
    let slot = Slot::unpack(raw);
    if slot.is_empty() {
        return Ok(None);
    }

    let alt_offset = slot.offset_sectors as u64 * constants::SIZE_UNIT;
    if alt_offset < HEADER_SIZE as u64 || alt_offset >= file_len {
        return Ok(None);
    }
    let max_read = (file_len - alt_offset).min(MAX_CHUNK_BYTES as u64) as usize;
    let mut buf = vec![0u8; max_read];
    file.seek(SeekFrom::Start(alt_offset))?;
    file.read_exact(&mut buf)?;

    let Ok(frame) = frame::parse(&buf) else { return Ok(None) };
    let codec = CodecRegistry::new();
    Ok(codec.decode_raw(frame.codec, frame.payload).ok())
}

/// Scan the data region past the header for a byte sequence that looks like a
/// valid frame length prefix, on the theory the offset table entry itself is
/// the corrupted part rather than the payload.
fn try_pattern_scan(file: &mut fs::File, file_len: u64) -> std::io::Result<Option<Vec<u8>>> {
    if file_len <= HEADER_SIZE as u64 {
        return Ok(None);
    }
    let mut buf = vec![0u8; (file_len - HEADER_SIZE as u64) as usize];
    file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
    file.read_exact(&mut buf)?;

    let codec = CodecRegistry::new();
    for candidate_offset in (0..buf.len().saturating_sub(constants::FRAME_HEADER_LEN)).step_by(constants::SECTOR_SIZE as usize) {
        if let Ok(frame) = frame::parse(&buf[candidate_offset..]) {
            if let Ok(payload) = codec.decode_raw(frame.codec, frame.payload) {
                return Ok(Some(payload));
            }
        }
    }
    Ok(None)
}
