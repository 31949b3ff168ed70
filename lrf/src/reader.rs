//! Region reader: random-access chunk lookups backed by an LRU decode cache (spec
//! §4.4).
//!
//! The cache holds decoded payloads, not raw frames, since decoding is the
//! expensive step. It is bounded by both an entry count and a running byte
//! budget; admission evicts least-recently-used entries until both limits are
//! satisfied, mirroring the eviction policy `lru` already implements for us.

use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use tracing::trace;

use crate::codec::CodecRegistry;
use crate::constants::MAX_CHUNK_BYTES;
use crate::frame;
use crate::resource::SharedRegion;

/// Default entry cap for the decode cache (spec §4.4).
pub const DEFAULT_CACHE_ENTRIES: usize = 64;
/// Default byte budget for the decode cache (spec §4.4).
pub const DEFAULT_CACHE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct ReaderStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReaderStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

struct CacheEntry {
    payload: Arc<[u8]>,
}

/// Reads chunks out of a single region, caching decoded payloads by chunk index.
pub struct RegionReader {
    region: Arc<SharedRegion>,
    codec: CodecRegistry,
    cache: LruCache<usize, CacheEntry>,
    cache_bytes: u64,
    max_entries: usize,
    max_bytes: u64,
    stats: ReaderStats,
}

impl RegionReader {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self::with_limits(region, DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_BYTES)
    }

    pub fn with_limits(region: Arc<SharedRegion>, max_entries: usize, max_bytes: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            region,
            codec: CodecRegistry::new(),
            cache: LruCache::new(capacity),
            cache_bytes: 0,
            max_entries,
            max_bytes,
            stats: ReaderStats::default(),
        }
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    pub fn current_cache_bytes(&self) -> u64 {
        self.cache_bytes
    }

    pub fn has_chunk(&self, x: i32, z: i32) -> Result<bool, crate::error::LrfError> {
        Ok(self.region.header()?.has_chunk(x, z))
    }

    /// Read one chunk, returning `None` for any absence or corruption condition the
    /// spec treats as "no data" rather than an error (spec §4.4 steps 2, 4, 6).
    pub fn read_chunk(&mut self, x: i32, z: i32) -> Result<Option<Vec<u8>>, crate::error::LrfError> {
        let idx = crate::constants::chunk_index(x, z);
        if let Some(entry) = self.cache.get(&idx) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.payload.to_vec()));
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let header = self.region.header()?;
        let slot = header.slot(x, z);
        if slot.is_empty() {
            return Ok(None);
        }
        let offset = slot.file_offset();
        let size = slot.size_sectors as u64 * crate::constants::SIZE_UNIT;
        if size == 0 || size as usize > MAX_CHUNK_BYTES {
            return Ok(None);
        }

        let mut buf = vec![0u8; size as usize];
        {
            let mut file = self.region.file().write().unwrap();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }

        let frame = match frame::parse(&buf) {
            Ok(frame) => frame,
            Err(_) => return Ok(None),
        };

        let payload = match self.codec.decode_raw(frame.codec, frame.payload) {
            Ok(payload) => payload,
            Err(_) => return Ok(None),
        };

        self.admit(idx, &payload);
        Ok(Some(payload))
    }

    /// Read every occupied chunk in the region, in offset-table index order (spec
    /// §4.4 `readAll`).
    pub fn read_all(&mut self) -> Result<Vec<((i32, i32), Vec<u8>)>, crate::error::LrfError> {
        let header = self.region.header()?;
        let coords: Vec<(i32, i32)> = header.iter_occupied().map(|(x, z, _)| (x, z)).collect();
        let mut out = Vec::with_capacity(coords.len());
        for (x, z) in coords {
            if let Some(data) = self.read_chunk(x, z)? {
                out.push(((x, z), data));
            }
        }
        Ok(out)
    }

    /// Read a specific list of chunks, preserving the caller's order; entries with no
    /// data are `None` (spec §4.4 `readBatch`).
    pub fn read_batch(
        &mut self,
        coords: &[(i32, i32)],
    ) -> Result<Vec<Option<Vec<u8>>>, crate::error::LrfError> {
        coords.iter().map(|&(x, z)| self.read_chunk(x, z)).collect()
    }

    /// Halve the cache's effective admission by evicting down to half its current
    /// entry cap (spec §5 "cache admission under pressure halves effective
    /// capacity").
    pub fn shrink_admission_under_pressure(&mut self) {
        let target = (self.max_entries / 2).max(1);
        while self.cache.len() > target {
            match self.cache.pop_lru() {
                Some((_, evicted)) => self.cache_bytes = self.cache_bytes.saturating_sub(evicted.payload.len() as u64),
                None => break,
            }
        }
    }

    fn admit(&mut self, idx: usize, payload: &[u8]) {
        let len = payload.len() as u64;
        if len > self.max_bytes {
            trace!(idx, len, "payload exceeds cache byte budget, not cached");
            return;
        }
        while self.cache_bytes + len > self.max_bytes || self.cache.len() >= self.max_entries {
            match self.cache.pop_lru() {
                Some((_, evicted)) => self.cache_bytes = self.cache_bytes.saturating_sub(evicted.payload.len() as u64),
                None => break,
            }
        }
        self.cache.put(idx, CacheEntry { payload: Arc::from(payload) });
        self.cache_bytes += len;
    }
}
