//! Integrity validator: per-chunk checksums, a companion sidecar file, and
//! validation against live chunk bytes (spec §4.9, §6).
//!
//! The primary algorithm is CRC32C; an optional backup algorithm (SHA-256 or
//! XXH64) covers the case where CRC32C's 32-bit space collides. Checksums are
//! stored in a sidecar file next to the region, one record per `(chunk, algorithm)`
//! pair: `chunkIndex (u16 LE) | algorithmId (u8) | digestLen (u8) | digest bytes`.
//! Record order is unspecified; this reader builds a map from them.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use byteorder::{LittleEndian, WriteBytesExt};
use sha2::{Digest, Sha256};
use tracing::warn;
use xxhash_rust::xxh64::xxh64;

use crate::constants::chunk_index;
use crate::error::IntegrityReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    None,
    Crc32c,
    Xxh64,
    Sha256,
}

impl Algorithm {
    fn id(self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Crc32c => 1,
            Algorithm::Xxh64 => 2,
            Algorithm::Sha256 => 3,
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Algorithm::None),
            1 => Some(Algorithm::Crc32c),
            2 => Some(Algorithm::Xxh64),
            3 => Some(Algorithm::Sha256),
            _ => None,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Algorithm::None => Vec::new(),
            Algorithm::Crc32c => crc32c::crc32c(data).to_le_bytes().to_vec(),
            Algorithm::Xxh64 => xxh64(data, 0).to_le_bytes().to_vec(),
            Algorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ChunkChecksums {
    primary: Option<(Algorithm, Vec<u8>)>,
    backup: Option<(Algorithm, Vec<u8>)>,
}

/// Validates chunk bytes against a persistent checksum sidecar file.
pub struct IntegrityValidator {
    sidecar_path: PathBuf,
    primary_algorithm: Algorithm,
    backup_algorithm: Algorithm,
    table: RwLock<HashMap<u16, ChunkChecksums>>,
}

impl IntegrityValidator {
    /// Open (or create empty) the sidecar file for `region_path`.
    pub fn open(region_path: impl AsRef<Path>, primary_algorithm: Algorithm, backup_algorithm: Algorithm) -> io::Result<Self> {
        let sidecar_path = sidecar_path_for(region_path.as_ref());
        let table = if sidecar_path.exists() {
            RwLock::new(read_sidecar(&sidecar_path)?)
        } else {
            RwLock::new(HashMap::new())
        };
        Ok(Self { sidecar_path, primary_algorithm, backup_algorithm, table })
    }

    /// Compute and persist the primary (and backup, if configured) digest for a
    /// chunk (spec §4.9 `updateChecksum`).
    pub fn update_checksum(&self, x: i32, z: i32, data: &[u8]) -> io::Result<()> {
        let idx = chunk_index(x, z) as u16;
        let entry = ChunkChecksums {
            primary: Some((self.primary_algorithm, self.primary_algorithm.digest(data))),
            backup: (self.backup_algorithm != Algorithm::None)
                .then(|| (self.backup_algorithm, self.backup_algorithm.digest(data))),
        };
        self.table.write().unwrap().insert(idx, entry);
        self.persist()
    }

    /// Recompute and compare against the stored checksums.
    ///
    /// Speculative validations (prefetch reads) never trigger auto-repair on
    /// their own; the caller decides whether to act on the report (spec §4.9).
    pub fn validate_chunk(&self, x: i32, z: i32, data: &[u8], _speculative: bool) -> IntegrityReport {
        let idx = chunk_index(x, z) as u16;
        let table = self.table.read().unwrap();
        let Some(entry) = table.get(&idx) else {
            return IntegrityReport::MissingChecksum;
        };

        let Some((algo, expected)) = entry.primary.as_ref() else {
            return IntegrityReport::MissingChecksum;
        };
        let primary_ok = algo.digest(data) == *expected;
        if primary_ok {
            return IntegrityReport::Valid;
        }

        match entry.backup.as_ref() {
            Some((backup_algo, expected_backup)) => {
                if backup_algo.digest(data) == *expected_backup {
                    warn!(x, z, "primary checksum mismatch, backup matched");
                    IntegrityReport::CorruptedPrimary
                } else {
                    IntegrityReport::CorruptedBoth
                }
            }
            None => IntegrityReport::CorruptedPrimary,
        }
    }

    /// Validate every chunk a reader currently exposes (spec §4.9 `validateRegion`).
    pub fn validate_region(
        &self,
        reader: &mut crate::reader::RegionReader,
    ) -> Result<Vec<((i32, i32), IntegrityReport)>, crate::error::LrfError> {
        let mut reports = Vec::new();
        for ((x, z), data) in reader.read_all()? {
            reports.push(((x, z), self.validate_chunk(x, z, &data, false)));
        }
        Ok(reports)
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }

    fn persist(&self) -> io::Result<()> {
        let table = self.table.read().unwrap();
        let mut buf = Vec::new();
        for (&idx, entry) in table.iter() {
            for (algo, digest) in entry.primary.iter().chain(entry.backup.iter()) {
                buf.write_u16::<LittleEndian>(idx)?;
                buf.write_u8(algo.id())?;
                buf.write_u8(digest.len() as u8)?;
                buf.extend_from_slice(digest);
            }
        }
        std::fs::write(&self.sidecar_path, buf)
    }
}

fn sidecar_path_for(region_path: &Path) -> PathBuf {
    let mut os = region_path.as_os_str().to_owned();
    os.push(".checksums");
    PathBuf::from(os)
}

fn read_sidecar(path: &Path) -> io::Result<HashMap<u16, ChunkChecksums>> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;

    let mut table: HashMap<u16, ChunkChecksums> = HashMap::new();
    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let idx = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
        let algorithm_id = bytes[pos + 2];
        let digest_len = bytes[pos + 3] as usize;
        pos += 4;
        if pos + digest_len > bytes.len() {
            break;
        }
        let digest = bytes[pos..pos + digest_len].to_vec();
        pos += digest_len;

        let Some(algo) = Algorithm::from_id(algorithm_id) else { continue };
        let entry = table.entry(idx).or_default();
        if entry.primary.is_none() {
            entry.primary = Some((algo, digest));
        } else {
            entry.backup = Some((algo, digest));
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_chunk_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let validator = IntegrityValidator::open(&path, Algorithm::Crc32c, Algorithm::None).unwrap();
        validator.update_checksum(1, 2, b"hello").unwrap();
        assert_eq!(validator.validate_chunk(1, 2, b"hello", false), IntegrityReport::Valid);
    }

    #[test]
    fn tampered_chunk_is_corrupted_primary_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let validator = IntegrityValidator::open(&path, Algorithm::Crc32c, Algorithm::None).unwrap();
        validator.update_checksum(1, 2, b"hello").unwrap();
        assert_eq!(validator.validate_chunk(1, 2, b"goodbye", false), IntegrityReport::CorruptedPrimary);
    }

    #[test]
    fn backup_recovers_from_primary_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let validator = IntegrityValidator::open(&path, Algorithm::Crc32c, Algorithm::Sha256).unwrap();
        validator.update_checksum(1, 2, b"hello").unwrap();

        // Corrupt only the stored primary digest on disk, leaving the backup intact,
        // then reopen so the validator loads the tampered sidecar from scratch.
        {
            let mut table = validator.table.write().unwrap();
            let entry = table.get_mut(&(chunk_index(1, 2) as u16)).unwrap();
            entry.primary.as_mut().unwrap().1 = vec![0xFF; 4];
        }
        validator.persist().unwrap();

        let reopened = IntegrityValidator::open(&path, Algorithm::Crc32c, Algorithm::Sha256).unwrap();
        assert_eq!(reopened.validate_chunk(1, 2, b"hello", false), IntegrityReport::CorruptedPrimary);
    }

    #[test]
    fn both_checksums_mismatch_is_corrupted_both() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let validator = IntegrityValidator::open(&path, Algorithm::Crc32c, Algorithm::Sha256).unwrap();
        validator.update_checksum(1, 2, b"hello").unwrap();
        assert_eq!(validator.validate_chunk(1, 2, b"tampered data", false), IntegrityReport::CorruptedBoth);
    }

    #[test]
    fn missing_checksum_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let validator = IntegrityValidator::open(&path, Algorithm::Crc32c, Algorithm::None).unwrap();
        assert_eq!(validator.validate_chunk(9, 9, b"anything", false), IntegrityReport::MissingChecksum);
    }

    #[test]
    fn sidecar_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        {
            let validator = IntegrityValidator::open(&path, Algorithm::Crc32c, Algorithm::None).unwrap();
            validator.update_checksum(4, 5, b"persisted").unwrap();
        }
        let reopened = IntegrityValidator::open(&path, Algorithm::Crc32c, Algorithm::None).unwrap();
        assert_eq!(reopened.validate_chunk(4, 5, b"persisted", false), IntegrityReport::Valid);
    }
}
