//! Region header: the fixed 8,192-byte metadata block at the front of every LRF file
//! (spec §3, §4.2, §6).
//!
//! The offset table is kept in memory as 1,024 lock-free `AtomicU32` slots plus a
//! parallel `AtomicBool` existence bitmap, so a single chunk lookup is one aligned
//! load with no locking (spec §5: "The header's offset-table slots use lock-free
//! atomic 32-bit stores since each slot is one word").

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::CompressionId;
use crate::constants::{self, CHUNKS_PER_REGION, HEADER_SIZE, MAGIC};
use crate::error::FormatError;

const VERSION_OFFSET: usize = 9;
const CHUNK_COUNT_OFFSET: usize = 13;
const DEFAULT_COMPRESSION_OFFSET: usize = 17;
const OFFSET_TABLE_OFFSET: usize = 21;
const OFFSET_TABLE_BYTES: usize = CHUNKS_PER_REGION * 4;

/// One offset-table entry: `(offsetSectors << 8) | (sizeSectors & 0xFF)`, as packed on
/// disk (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    pub offset_sectors: u32,
    pub size_sectors: u8,
}

impl Slot {
    #[inline]
    pub fn pack(self) -> u32 {
        (self.offset_sectors << 8) | self.size_sectors as u32
    }

    #[inline]
    pub fn unpack(raw: u32) -> Self {
        Self {
            offset_sectors: raw >> 8,
            size_sectors: (raw & 0xFF) as u8,
        }
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.size_sectors == 0
    }

    #[inline]
    pub fn file_offset(self) -> u64 {
        self.offset_sectors as u64 * constants::SECTOR_SIZE
    }
}

/// In-memory offset table and region-level metadata, shared by the reader, writer and
/// shared region resource.
#[derive(Debug)]
pub struct Header {
    version: u32,
    chunk_count: AtomicU32,
    default_compression: AtomicU32,
    slots: Box<[AtomicU32; CHUNKS_PER_REGION]>,
    exists: Box<[AtomicBool; CHUNKS_PER_REGION]>,
}

impl Header {
    /// Build a fresh, empty header for a newly created region.
    pub fn empty(default_compression: CompressionId) -> Self {
        Self {
            version: constants::FORMAT_VERSION,
            chunk_count: AtomicU32::new(0),
            default_compression: AtomicU32::new(default_compression.as_u8() as u32),
            slots: Box::new(std::array::from_fn(|_| AtomicU32::new(0))),
            exists: Box::new(std::array::from_fn(|_| AtomicBool::new(false))),
        }
    }

    /// Parse a header from an exact `HEADER_SIZE`-byte buffer (spec §4.2 `read`).
    pub fn read(buffer: &[u8]) -> Result<Self, FormatError> {
        if buffer.len() < HEADER_SIZE {
            return Err(FormatError::FileTooSmall(HEADER_SIZE));
        }
        if &buffer[0..9] != MAGIC.as_slice() {
            return Err(FormatError::InvalidMagic);
        }
        let version = LittleEndian::read_u32(&buffer[VERSION_OFFSET..VERSION_OFFSET + 4]);
        if version == 0 || version > constants::FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let chunk_count = LittleEndian::read_u32(&buffer[CHUNK_COUNT_OFFSET..CHUNK_COUNT_OFFSET + 4]);
        if chunk_count as usize > CHUNKS_PER_REGION {
            return Err(FormatError::InvalidChunkCount);
        }
        let default_compression =
            LittleEndian::read_u32(&buffer[DEFAULT_COMPRESSION_OFFSET..DEFAULT_COMPRESSION_OFFSET + 4]);

        let slots: Box<[AtomicU32; CHUNKS_PER_REGION]> = Box::new(std::array::from_fn(|i| {
            let off = OFFSET_TABLE_OFFSET + i * 4;
            AtomicU32::new(LittleEndian::read_u32(&buffer[off..off + 4]))
        }));
        let exists: Box<[AtomicBool; CHUNKS_PER_REGION]> = Box::new(std::array::from_fn(|i| {
            let raw = slots[i].load(Ordering::Relaxed);
            AtomicBool::new(Slot::unpack(raw).size_sectors != 0)
        }));

        Ok(Self {
            version,
            chunk_count: AtomicU32::new(chunk_count),
            default_compression: AtomicU32::new(default_compression),
            slots,
            exists,
        })
    }

    /// Serialize the full header into an `HEADER_SIZE`-byte buffer (spec §4.2 `write`).
    pub fn write(&self, buffer: &mut [u8]) {
        debug_assert!(buffer.len() >= HEADER_SIZE);
        buffer[..HEADER_SIZE].fill(0);
        buffer[0..9].copy_from_slice(MAGIC.as_slice());
        LittleEndian::write_u32(&mut buffer[VERSION_OFFSET..VERSION_OFFSET + 4], self.version);
        LittleEndian::write_u32(
            &mut buffer[CHUNK_COUNT_OFFSET..CHUNK_COUNT_OFFSET + 4],
            self.chunk_count.load(Ordering::Acquire),
        );
        LittleEndian::write_u32(
            &mut buffer[DEFAULT_COMPRESSION_OFFSET..DEFAULT_COMPRESSION_OFFSET + 4],
            self.default_compression.load(Ordering::Acquire),
        );
        for i in 0..CHUNKS_PER_REGION {
            let off = OFFSET_TABLE_OFFSET + i * 4;
            LittleEndian::write_u32(&mut buffer[off..off + 4], self.slots[i].load(Ordering::Acquire));
        }
        // bytes 4117..8192 stay zero padding.
    }

    /// Serialize only the 4-byte slot for `index` and its absolute offset within the
    /// header buffer, for the writer's granular on-disk update (spec §4.5).
    pub fn slot_byte_offset(index: usize) -> usize {
        OFFSET_TABLE_OFFSET + index * 4
    }

    #[inline]
    pub fn has_chunk(&self, x: i32, z: i32) -> bool {
        self.exists[constants::chunk_index(x, z)].load(Ordering::Acquire)
    }

    #[inline]
    pub fn slot(&self, x: i32, z: i32) -> Slot {
        let idx = constants::chunk_index(x, z);
        Slot::unpack(self.slots[idx].load(Ordering::Acquire))
    }

    #[inline]
    pub fn get_offset(&self, x: i32, z: i32) -> Option<u64> {
        let slot = self.slot(x, z);
        (!slot.is_empty()).then(|| slot.file_offset())
    }

    #[inline]
    pub fn get_size(&self, x: i32, z: i32) -> Option<u64> {
        let slot = self.slot(x, z);
        (!slot.is_empty()).then(|| slot.size_sectors as u64 * constants::SIZE_UNIT)
    }

    /// Update the slot for `(x, z)`. `size == 0` clears existence (spec §4.2
    /// invariant). Returns the packed raw value, for callers that need to mirror it
    /// into an on-disk granular update.
    pub fn set_chunk_data(&self, x: i32, z: i32, offset: u64, size: u64) -> u32 {
        let idx = constants::chunk_index(x, z);
        let offset_sectors = (offset / constants::SECTOR_SIZE) as u32;
        let size_sectors = size.div_ceil(constants::SIZE_UNIT).min(constants::MAX_SIZE_SECTORS) as u8;
        let slot = Slot {
            offset_sectors,
            size_sectors: if size == 0 { 0 } else { size_sectors.max(1) },
        };
        let raw = slot.pack();
        let existed = self.exists[idx].swap(!slot.is_empty(), Ordering::AcqRel);
        self.slots[idx].store(raw, Ordering::Release);
        if slot.is_empty() && existed {
            self.chunk_count.fetch_sub(1, Ordering::AcqRel);
        } else if !slot.is_empty() && !existed {
            self.chunk_count.fetch_add(1, Ordering::AcqRel);
        }
        raw
    }

    pub fn default_compression(&self) -> CompressionId {
        CompressionId::from_u8(self.default_compression.load(Ordering::Acquire) as u8)
            .unwrap_or(CompressionId::None)
    }

    pub fn set_default_compression(&self, id: CompressionId) {
        self.default_compression.store(id.as_u8() as u32, Ordering::Release);
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Iterate over every occupied slot, yielding `(x, z, Slot)` in index order. Used
    /// by region-wide scans (integrity validation, corruption detection).
    pub fn iter_occupied(&self) -> impl Iterator<Item = (i32, i32, Slot)> + '_ {
        (0..CHUNKS_PER_REGION).filter_map(move |idx| {
            let raw = self.slots[idx].load(Ordering::Acquire);
            let slot = Slot::unpack(raw);
            (!slot.is_empty()).then(|| {
                let x = (idx % 32) as i32;
                let z = (idx / 32) as i32;
                (x, z, slot)
            })
        })
    }
}
