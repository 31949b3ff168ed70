//! Memory-mapped read-ahead engine: serves chunk reads through an `mmap` view of
//! the region with a decode cache and a predictive prefetcher (spec §4.8).
//!
//! Prefetching follows the access history's derived movement vector plus a ring
//! around the most recent access, and is dropped outright once the cache is past
//! its soft memory threshold (70% of its byte budget) — a purely local signal,
//! independent of the crate-wide [`crate::pressure::PressureMonitor`], which the
//! storage manager consults separately to decide whether to suspend prefetching
//! globally.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::trace;

use crate::codec::CodecRegistry;
use crate::config::MmapConfig;
use crate::constants::{chunk_index, MAX_CHUNK_BYTES};
use crate::error::LrfError;
use crate::frame;
use crate::pool::WorkerPool;
use crate::resource::SharedRegion;

/// Soft threshold, as a fraction of `max_bytes`, past which prefetch tasks are
/// dropped rather than enqueued (spec §4.8).
const SOFT_MEMORY_THRESHOLD: f64 = 0.7;

/// How many recent accesses feed the movement-vector prediction.
const HISTORY_LEN: usize = 8;

#[derive(Debug, Default)]
pub struct MmapStats {
    hits: AtomicU64,
    misses: AtomicU64,
    prefetched: AtomicU64,
    dropped_prefetch: AtomicU64,
}

impl MmapStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn prefetched(&self) -> u64 {
        self.prefetched.load(Ordering::Relaxed)
    }
    pub fn dropped_prefetch(&self) -> u64 {
        self.dropped_prefetch.load(Ordering::Relaxed)
    }
}

struct Inner {
    cache: LruCache<usize, Arc<[u8]>>,
    cache_bytes: u64,
    history: VecDeque<(i32, i32)>,
}

/// Serves reads for one region through its mmap view.
pub struct MmapEngine {
    region: Arc<SharedRegion>,
    codec: CodecRegistry,
    config: MmapConfig,
    inner: Mutex<Inner>,
    stats: MmapStats,
}

impl MmapEngine {
    pub fn new(region: Arc<SharedRegion>, config: MmapConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_cache_entries.max(1)).unwrap();
        Self {
            region,
            codec: CodecRegistry::new(),
            config,
            inner: Mutex::new(Inner { cache: LruCache::new(capacity), cache_bytes: 0, history: VecDeque::new() }),
            stats: MmapStats::default(),
        }
    }

    pub fn stats(&self) -> &MmapStats {
        &self.stats
    }

    pub fn is_cached(&self, x: i32, z: i32) -> bool {
        self.inner.lock().unwrap().cache.contains(&chunk_index(x, z))
    }

    /// Evict a chunk's decoded payload, if cached. Must be called on every write
    /// that lands through the writer rather than this engine, or a later
    /// `read_chunk` would keep serving the stale pre-write bytes (spec §4.7/§4.8
    /// read-your-writes).
    pub fn invalidate(&self, x: i32, z: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(evicted) = inner.cache.pop(&chunk_index(x, z)) {
            inner.cache_bytes = inner.cache_bytes.saturating_sub(evicted.len() as u64);
        }
    }

    /// Read a chunk through the mmap view, decoding and caching on miss, then
    /// optionally enqueueing prefetch for predicted neighbors onto `prefetch_pool`
    /// (spec §4.8).
    pub fn read_chunk(
        self: &Arc<Self>,
        x: i32,
        z: i32,
        prefetch_pool: Option<&WorkerPool>,
    ) -> Result<Option<Vec<u8>>, LrfError> {
        let idx = chunk_index(x, z);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(payload) = inner.cache.get(&idx) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(payload.to_vec()));
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let payload = self.decode_through_mmap(x, z)?;
        if let Some(ref data) = payload {
            self.admit(idx, data);
            self.record_access_and_prefetch(x, z, prefetch_pool);
        }
        Ok(payload)
    }

    fn decode_through_mmap(&self, x: i32, z: i32) -> Result<Option<Vec<u8>>, LrfError> {
        let header = self.region.header()?;
        let slot = header.slot(x, z);
        if slot.is_empty() {
            return Ok(None);
        }
        let size = slot.size_sectors as u64 * crate::constants::SIZE_UNIT;
        if size == 0 || size as usize > MAX_CHUNK_BYTES {
            return Ok(None);
        }
        let offset = slot.file_offset() as usize;

        let mmap = self.region.mmap()?;
        if offset + size as usize > mmap.len() {
            return Ok(None);
        }
        let bytes = &mmap[offset..offset + size as usize];

        let frame = match frame::parse(bytes) {
            Ok(frame) => frame,
            Err(_) => return Ok(None),
        };
        match self.codec.decode_raw(frame.codec, frame.payload) {
            Ok(payload) => Ok(Some(payload)),
            Err(_) => Ok(None),
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cache.clear();
        inner.cache_bytes = 0;
        self.region.invalidate_mmap();
    }

    fn admit(&self, idx: usize, payload: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let len = payload.len() as u64;

        // Cache admission halves effective capacity under elevated pressure; the
        // caller passes the pressure-aware cap via `effective_entry_cap`.
        let cap = self.config.max_cache_entries;
        if len > self.config.max_memory_usage_bytes {
            return;
        }
        while inner.cache_bytes + len > self.config.max_memory_usage_bytes || inner.cache.len() >= cap {
            match inner.cache.pop_lru() {
                Some((_, evicted)) => inner.cache_bytes = inner.cache_bytes.saturating_sub(evicted.len() as u64),
                None => break,
            }
        }
        inner.cache.put(idx, Arc::from(payload));
        inner.cache_bytes += len;
    }

    /// Halve the cache's effective admission by evicting down to half its current
    /// entry cap (spec §5 "cache admission under pressure halves effective
    /// capacity").
    pub fn shrink_admission_under_pressure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let target = (self.config.max_cache_entries / 2).max(1);
        while inner.cache.len() > target {
            match inner.cache.pop_lru() {
                Some((_, evicted)) => inner.cache_bytes = inner.cache_bytes.saturating_sub(evicted.len() as u64),
                None => break,
            }
        }
    }

    fn record_access_and_prefetch(self: &Arc<Self>, x: i32, z: i32, prefetch_pool: Option<&WorkerPool>) {
        if !self.config.predictive_enabled {
            return;
        }

        let (over_threshold, predicted) = {
            let mut inner = self.inner.lock().unwrap();
            inner.history.push_back((x, z));
            if inner.history.len() > HISTORY_LEN {
                inner.history.pop_front();
            }
            let predicted = predicted_cells(
                &inner.history,
                (x, z),
                self.config.prediction_scale,
                self.config.prefetch_distance,
            );
            let over_threshold =
                inner.cache_bytes as f64 > SOFT_MEMORY_THRESHOLD * self.config.max_memory_usage_bytes as f64;
            (over_threshold, predicted)
        };

        if over_threshold {
            self.stats.dropped_prefetch.fetch_add(predicted.len() as u64, Ordering::Relaxed);
            trace!(x, z, count = predicted.len(), "cache over soft threshold, dropping prefetch");
            return;
        }

        let Some(pool) = prefetch_pool else { return };
        for (px, pz) in predicted {
            if self.is_cached(px, pz) {
                continue;
            }
            self.stats.prefetched.fetch_add(1, Ordering::Relaxed);
            let engine = Arc::clone(self);
            let _ = pool.submit(move || {
                // Decode and admit directly, bypassing `read_chunk`: a prefetch hit
                // must not feed the access-history model, or it would skew the
                // movement vector toward its own predictions.
                if let Ok(Some(payload)) = engine.decode_through_mmap(px, pz) {
                    engine.admit(chunk_index(px, pz), &payload);
                }
            });
        }
    }
}

/// Derive the predicted prefetch set from the access history: `predictionScale`
/// cells along the movement vector, plus a ring of radius `prefetch_distance`
/// around `current` (spec §4.8). Pure function so the prediction logic can be
/// exercised without any filesystem or thread-pool machinery.
fn predicted_cells(
    history: &VecDeque<(i32, i32)>,
    current: (i32, i32),
    prediction_scale: i32,
    prefetch_distance: i32,
) -> Vec<(i32, i32)> {
    let mut out = Vec::new();

    if let Some(vector) = movement_vector(history) {
        for step in 1..=prediction_scale.max(0) {
            out.push((current.0 + vector.0 * step, current.1 + vector.1 * step));
        }
    }

    let d = prefetch_distance.max(0);
    for dx in -d..=d {
        for dz in -d..=d {
            if dx.abs().max(dz.abs()) == d && d > 0 {
                out.push((current.0 + dx, current.1 + dz));
            }
        }
    }

    out
}

/// Average the deltas between consecutive recent accesses into a unit-ish vector
/// (each axis clamped to {-1, 0, 1}), or `None` with fewer than two samples.
fn movement_vector(history: &VecDeque<(i32, i32)>) -> Option<(i32, i32)> {
    if history.len() < 2 {
        return None;
    }
    let mut sum_dx = 0i64;
    let mut sum_dz = 0i64;
    let mut count = 0i64;
    for pair in history.iter().collect::<Vec<_>>().windows(2) {
        let (ax, az) = pair[0];
        let (bx, bz) = pair[1];
        sum_dx += (bx - ax) as i64;
        sum_dz += (bz - az) as i64;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let avg_dx = sum_dx as f64 / count as f64;
    let avg_dz = sum_dz as f64 / count as f64;
    Some((avg_dx.signum() as i32, avg_dz.signum() as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionId;
    use crate::writer::RegionWriter;

    #[test]
    fn movement_vector_follows_consistent_stride() {
        let mut history = VecDeque::new();
        for i in 0..4 {
            history.push_back((i, 0));
        }
        assert_eq!(movement_vector(&history), Some((1, 0)));
    }

    #[test]
    fn movement_vector_needs_two_samples() {
        let mut history = VecDeque::new();
        history.push_back((0, 0));
        assert_eq!(movement_vector(&history), None);
    }

    #[test]
    fn predicted_cells_includes_vector_steps_and_ring() {
        let mut history = VecDeque::new();
        history.push_back((0, 0));
        history.push_back((1, 0));
        let predicted = predicted_cells(&history, (1, 0), 2, 1);
        assert!(predicted.contains(&(2, 0)));
        assert!(predicted.contains(&(3, 0)));
        // Ring of radius 1 around (1, 0).
        assert!(predicted.contains(&(0, 0)));
        assert!(predicted.contains(&(2, 1)));
    }

    #[test]
    fn read_chunk_caches_and_reports_stats() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::open(dir.path().join("r.0.0.lrf"), CompressionId::None).unwrap();
        let mut writer = RegionWriter::new(Arc::clone(&region));
        writer.write_chunk(2, 2, b"mmap payload").unwrap();
        writer.flush().unwrap();

        let engine = Arc::new(MmapEngine::new(Arc::clone(&region), MmapConfig { predictive_enabled: false, ..Default::default() }));
        let first = engine.read_chunk(2, 2, None).unwrap().unwrap();
        assert_eq!(first, b"mmap payload");
        assert!(engine.is_cached(2, 2));
        let second = engine.read_chunk(2, 2, None).unwrap().unwrap();
        assert_eq!(second, first);
        assert_eq!(engine.stats().hits(), 1);
        assert_eq!(engine.stats().misses(), 1);
    }

    #[test]
    fn prefetch_admits_predicted_neighbors_into_cache() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::open(dir.path().join("r.0.0.lrf"), CompressionId::None).unwrap();
        let mut writer = RegionWriter::new(Arc::clone(&region));
        for i in 0..5 {
            writer.write_chunk(i, 0, format!("chunk-{i}").as_bytes()).unwrap();
        }
        writer.flush().unwrap();

        let config = MmapConfig { predictive_enabled: true, prediction_scale: 2, prefetch_distance: 0, ..Default::default() };
        let engine = Arc::new(MmapEngine::new(Arc::clone(&region), config));
        let pool = WorkerPool::new("test-prefetch", 2, 16);

        engine.read_chunk(0, 0, Some(&pool)).unwrap();
        engine.read_chunk(1, 0, Some(&pool)).unwrap();
        engine.read_chunk(2, 0, Some(&pool)).unwrap();

        pool.shutdown();
        assert!(engine.is_cached(3, 0));
        assert!(engine.is_cached(4, 0));
    }

    #[test]
    fn invalidate_forces_a_fresh_decode_on_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::open(dir.path().join("r.0.0.lrf"), CompressionId::None).unwrap();
        let mut writer = RegionWriter::new(Arc::clone(&region));
        writer.write_chunk(2, 2, b"first").unwrap();
        writer.flush().unwrap();

        let engine = Arc::new(MmapEngine::new(Arc::clone(&region), MmapConfig { predictive_enabled: false, ..Default::default() }));
        assert_eq!(engine.read_chunk(2, 2, None).unwrap().unwrap(), b"first");
        assert!(engine.is_cached(2, 2));

        engine.invalidate(2, 2);
        assert!(!engine.is_cached(2, 2));

        writer.write_chunk(2, 2, b"second").unwrap();
        writer.flush().unwrap();
        assert_eq!(engine.read_chunk(2, 2, None).unwrap().unwrap(), b"second");
    }

    #[test]
    fn missing_chunk_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::open(dir.path().join("r.0.0.lrf"), CompressionId::None).unwrap();
        let engine = Arc::new(MmapEngine::new(region, MmapConfig::default()));
        assert!(engine.read_chunk(9, 9, None).unwrap().is_none());
    }
}
