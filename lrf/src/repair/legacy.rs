//! Detection-only recognizer for the legacy two-sector region layout (grounded on
//! `mc173::serde::region::Region`): a 4096-byte big-endian offset/count table, a
//! second 4096-byte big-endian timestamp table, then 4096-sector-aligned chunks
//! each prefixed by a 4-byte big-endian length (covering a 1-byte compression id
//! plus the gzip/zlib payload) rather than this crate's 8192-byte header and
//! little-endian offset table.
//!
//! This module only recognizes the layout; it never reads chunk data out of it or
//! writes to it. Migrating a legacy region into this format is a one-time,
//! external concern, not something the storage engine performs implicitly.

use std::fs;
use std::io;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

const LEGACY_HEADER_SIZE: usize = 8192;
const SECTOR_SIZE: usize = 4096;
const SLOT_COUNT: usize = 1024;

/// A guess at whether a file is a legacy region, with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyDetection {
    pub is_legacy: bool,
    pub occupied_slots: usize,
    pub plausible_slots: usize,
}

/// Inspect `path` for the legacy two-sector layout without assuming it is this
/// crate's own format first; a file this recognizes as legacy will usually have
/// already failed [`super::detect_corruption`]'s magic check.
pub fn detect_legacy_region(path: impl AsRef<Path>) -> io::Result<LegacyDetection> {
    let bytes = fs::read(path.as_ref())?;
    if bytes.len() < LEGACY_HEADER_SIZE || bytes.len() % SECTOR_SIZE != 0 {
        return Ok(LegacyDetection { is_legacy: false, occupied_slots: 0, plausible_slots: 0 });
    }

    let sector_count = bytes.len() / SECTOR_SIZE;
    let mut occupied_slots = 0usize;
    let mut plausible_slots = 0usize;

    for idx in 0..SLOT_COUNT {
        let raw = BigEndian::read_u32(&bytes[idx * 4..idx * 4 + 4]);
        let offset = (raw >> 8) as usize;
        let count = (raw & 0xFF) as usize;
        if count == 0 {
            continue;
        }
        occupied_slots += 1;

        // A legacy slot is plausible if its sectors land past the two reserved
        // header sectors and inside the file, and the chunk it points to starts
        // with a length prefix whose compression id is gzip (1) or zlib (2).
        if offset < 2 || offset + count > sector_count {
            continue;
        }
        let chunk_start = offset * SECTOR_SIZE;
        if chunk_start + 5 > bytes.len() {
            continue;
        }
        let declared_len = BigEndian::read_u32(&bytes[chunk_start..chunk_start + 4]) as usize;
        let compression_id = bytes[chunk_start + 4];
        let fits_sectors = declared_len + 4 <= count * SECTOR_SIZE;
        if fits_sectors && matches!(compression_id, 1 | 2) {
            plausible_slots += 1;
        }
    }

    // Require a majority of occupied slots to look plausible before calling it
    // legacy, so a mostly-corrupted region of either format doesn't get
    // misclassified off a handful of coincidental byte patterns.
    let is_legacy = occupied_slots > 0 && plausible_slots * 2 >= occupied_slots;
    Ok(LegacyDetection { is_legacy, occupied_slots, plausible_slots })
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
    use std::io::Write;

    fn write_legacy_region(path: &Path, chunks: &[(i32, i32, &[u8])]) {
        let mut offsets = vec![0u8; SECTOR_SIZE];
        let mut timestamps = vec![0u8; SECTOR_SIZE];
        let mut body = Vec::new();
        let mut next_sector = 2u32;

        for &(cx, cz, payload) in chunks {
            let idx = (cx & 31) as usize | (((cz & 31) as usize) << 5);
            let total_len = payload.len() + 1;
            let sector_count = ((total_len + 4).div_ceil(SECTOR_SIZE)) as u32;

            BigEndian::write_u32(&mut offsets[idx * 4..idx * 4 + 4], (next_sector << 8) | sector_count);
            BigEndian::write_u32(&mut timestamps[idx * 4..idx * 4 + 4], 0);

            body.write_u32::<BigEndian>(total_len as u32).unwrap();
            body.write_u8(2).unwrap(); // zlib
            body.extend_from_slice(payload);
            let padded = sector_count as usize * SECTOR_SIZE;
            body.resize(body.len() + (padded - (total_len + 4)), 0);

            next_sector += sector_count;
        }

        let mut file = fs::File::create(path).unwrap();
        file.write_all(&offsets).unwrap();
        file.write_all(&timestamps).unwrap();
        file.write_all(&body).unwrap();
    }

    #[test]
    fn recognizes_a_well_formed_legacy_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.mcr");
        write_legacy_region(&path, &[(1, 1, b"fake zlib payload")]);

        let detection = detect_legacy_region(&path).unwrap();
        assert!(detection.is_legacy);
        assert_eq!(detection.occupied_slots, 1);
        assert_eq!(detection.plausible_slots, 1);
    }

    #[test]
    fn rejects_a_file_too_small_to_hold_the_legacy_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("too-small.mcr");
        fs::write(&path, [0u8; 128]).unwrap();

        let detection = detect_legacy_region(&path).unwrap();
        assert!(!detection.is_legacy);
    }

    #[test]
    fn rejects_an_lrf_region_despite_matching_size_constraints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        // An empty LRF region is all zero past the magic/version fields, which
        // reads as zero offsets everywhere: no occupied slots, so not legacy.
        fs::write(&path, vec![0u8; crate::constants::HEADER_SIZE]).unwrap();

        let detection = detect_legacy_region(&path).unwrap();
        assert!(!detection.is_legacy);
        assert_eq!(detection.occupied_slots, 0);
    }
}
