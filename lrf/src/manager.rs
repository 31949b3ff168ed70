//! Storage manager: the coordinator that wires a region's reader, writer, batch
//! loader/saver, mmap engine and integrity validator together per path, and owns
//! the five shared worker pools (spec §4.10).
//!
//! Grounded on `mc173::storage::ChunkStorage`, which owns one `StorageWorker` per
//! loaded dimension behind a request/reply channel; this coordinator generalizes
//! that shape to one component bundle per region file, dispatched across five
//! differently-sized pools instead of `ChunkStorage`'s single worker thread.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::batch::loader::BatchLoader;
use crate::batch::saver::{BatchSaver, PostFlushHook};
use crate::bufpool::BufferPool;
use crate::config::Config;
use crate::error::{IntegrityReport, LrfError, LrfResult};
use crate::future::{self, LrfFuture};
use crate::integrity::IntegrityValidator;
use crate::mmap::MmapEngine;
use crate::pool::WorkerPool;
use crate::pressure::PressureMonitor;
use crate::reader::RegionReader;
use crate::repair;
use crate::resource::SharedRegion;
use crate::writer::RegionWriter;

/// Initial worker counts, picked within the bounds spec.md §4.10 gives as examples
/// (load ≤ 32, write ≤ 8, compress ≤ 16, decompress ≤ 32, prefetch ≥ 2).
const LOAD_POOL_SIZE: usize = 8;
const WRITE_POOL_SIZE: usize = 4;
const COMPRESS_POOL_SIZE: usize = 4;
const DECOMPRESS_POOL_SIZE: usize = 8;
const PREFETCH_POOL_SIZE: usize = 2;

const POOL_QUEUE_CAPACITY: usize = 1024;

const PRESSURE_TICK: Duration = Duration::from_secs(1);
const WRITE_POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const OTHER_POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Recoverable-I/O retry policy (spec §7): exponential backoff starting at
/// 100 ms, doubling, capped at 2 s, at most 3 attempts total.
const IO_RETRY_MAX_ATTEMPTS: u32 = 3;
const IO_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const IO_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

struct Pools {
    load: Arc<WorkerPool>,
    write: Arc<WorkerPool>,
    compress: Arc<WorkerPool>,
    decompress: Arc<WorkerPool>,
    prefetch: Arc<WorkerPool>,
}

/// The full component set the coordinator keeps for one region path.
struct RegionComponents {
    region: Arc<SharedRegion>,
    reader: Mutex<RegionReader>,
    sync_writer: Mutex<RegionWriter>,
    loader: Option<Arc<BatchLoader>>,
    saver: Option<Arc<BatchSaver>>,
    mmap: Option<Arc<MmapEngine>>,
    integrity: Option<Arc<IntegrityValidator>>,
}

impl RegionComponents {
    /// Tear down in the order spec.md §4.10 mandates: saver, loader, mmap, reader,
    /// validator, then the shared resource.
    fn close(&self) {
        if let Some(saver) = &self.saver {
            saver.shutdown();
        }
        // The batch loader has no background threads beyond its per-call gather
        // threads, which exit on their own; nothing to join here.
        if let Some(mmap) = &self.mmap {
            mmap.close();
        }
        // The reader and the integrity validator hold no background state either.
        self.region.release();
    }
}

/// Coordinates every region under management: the crate's public entry point for
/// load/save/flush, owning the per-path component maps and the five shared pools.
pub struct StorageManager {
    config: Config,
    regions: Mutex<HashMap<PathBuf, Arc<RegionComponents>>>,
    pools: Pools,
    pressure: PressureMonitor,
    pressure_monitor: Mutex<Option<JoinHandle<()>>>,
    prefetch_suspended: AtomicBool,
    buffers: BufferPool,
    shutting_down: AtomicBool,
}

impl StorageManager {
    pub fn new(config: Config) -> Arc<Self> {
        let pools = Pools {
            load: Arc::new(WorkerPool::new("load", LOAD_POOL_SIZE, POOL_QUEUE_CAPACITY)),
            write: Arc::new(WorkerPool::new("write", WRITE_POOL_SIZE, POOL_QUEUE_CAPACITY)),
            compress: Arc::new(WorkerPool::new("compress", COMPRESS_POOL_SIZE, POOL_QUEUE_CAPACITY)),
            decompress: Arc::new(WorkerPool::new("decompress", DECOMPRESS_POOL_SIZE, POOL_QUEUE_CAPACITY)),
            prefetch: Arc::new(WorkerPool::new("prefetch", PREFETCH_POOL_SIZE, POOL_QUEUE_CAPACITY)),
        };
        let pressure = PressureMonitor::new(config.mmap.max_memory_usage_bytes);

        let manager = Arc::new(Self {
            config,
            regions: Mutex::new(HashMap::new()),
            pools,
            pressure,
            pressure_monitor: Mutex::new(None),
            prefetch_suspended: AtomicBool::new(false),
            buffers: BufferPool::new(16 * 1024 * 1024),
            shutting_down: AtomicBool::new(false),
        });
        manager.spawn_pressure_monitor();
        manager
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load one chunk (spec §4.10 consultation order: pending map, mmap, batch
    /// loader, direct reader — the pending map comes first so an unflushed write
    /// is never shadowed by a stale mmap cache entry).
    #[instrument(skip(self, path))]
    pub fn load_chunk(self: &Arc<Self>, path: impl AsRef<Path>, x: i32, z: i32) -> LrfFuture<Option<Vec<u8>>> {
        let path = path.as_ref().to_path_buf();
        let this = Arc::clone(self);
        self.submit_with_timeout(&self.pools.load, move || this.load_chunk_sync(&path, x, z, false))
    }

    /// Load a list of coordinates, preserving the caller's order in the result.
    pub fn load_chunks(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
        coords: Vec<(i32, i32)>,
    ) -> LrfFuture<Vec<Option<Vec<u8>>>> {
        let path = path.as_ref().to_path_buf();
        let this = Arc::clone(self);
        self.submit_with_timeout(&self.pools.load, move || {
            coords.iter().map(|&(x, z)| this.load_chunk_sync(&path, x, z, false)).collect()
        })
    }

    /// Save one chunk. Defensively copies the caller's bytes via the shared buffer
    /// pool, then hands them to the batch saver, or writes synchronously through
    /// the writer on the write pool if batching is disabled (spec §4.10).
    #[instrument(skip(self, path, data))]
    pub fn save_chunk(self: &Arc<Self>, path: impl AsRef<Path>, x: i32, z: i32, data: &[u8]) -> LrfFuture<()> {
        let mut scratch = self.buffers.acquire(data.len());
        scratch.extend_from_slice(data);
        let owned = scratch.clone();

        let path = path.as_ref().to_path_buf();
        let this = Arc::clone(self);
        self.submit_with_timeout(&self.pools.write, move || this.save_chunk_sync(&path, x, z, owned))
    }

    /// Force a durable flush of any pending batch and the header for `path`.
    pub fn flush(self: &Arc<Self>, path: impl AsRef<Path>) -> LrfFuture<()> {
        let path = path.as_ref().to_path_buf();
        let this = Arc::clone(self);
        self.submit_with_timeout(&self.pools.write, move || {
            let comps = this.get_or_open(&path)?;
            if let Some(saver) = &comps.saver {
                saver.flush_batch();
            }
            comps.sync_writer.lock().unwrap().flush()
        })
    }

    /// Whether a chunk has data, checking the saver's pending map before falling
    /// back to the on-disk header.
    pub fn has_data_for(self: &Arc<Self>, path: impl AsRef<Path>, x: i32, z: i32) -> bool {
        let Ok(comps) = self.get_or_open(path.as_ref()) else { return false };
        if let Some(saver) = &comps.saver {
            if saver.has_pending_chunk(x, z) {
                return true;
            }
        }
        comps.reader.lock().unwrap().has_chunk(x, z).unwrap_or(false)
    }

    /// Close and forget one region's components without shutting down the shared
    /// pools. A later load/save for the same path reopens it from scratch.
    pub fn close_region(self: &Arc<Self>, path: impl AsRef<Path>) {
        let Ok(normalized) = normalize_path(path.as_ref()) else { return };
        let removed = self.regions.lock().unwrap().remove(&normalized);
        if let Some(comps) = removed {
            comps.close();
        }
    }

    /// Flush every region, close every per-path component set in spec order, then
    /// shut down the five shared pools with per-pool timeouts (spec §4.10).
    pub fn close(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Release);

        let regions: Vec<Arc<RegionComponents>> = self.regions.lock().unwrap().drain().map(|(_, v)| v).collect();
        for comps in &regions {
            if let Some(saver) = &comps.saver {
                saver.flush_batch();
            }
        }
        for comps in regions {
            comps.close();
        }

        if let Some(handle) = self.pressure_monitor.lock().unwrap().take() {
            let _ = handle.join();
        }

        if !self.pools.write.shutdown_timeout(WRITE_POOL_SHUTDOWN_TIMEOUT) {
            warn!(pool = "write", "shutdown timed out, worker threads left to drain in background");
        }
        for (name, pool) in [
            ("load", &self.pools.load),
            ("compress", &self.pools.compress),
            ("decompress", &self.pools.decompress),
            ("prefetch", &self.pools.prefetch),
        ] {
            if !pool.shutdown_timeout(OTHER_POOL_SHUTDOWN_TIMEOUT) {
                warn!(pool = name, "shutdown timed out, worker threads left to drain in background");
            }
        }
    }

    // --- internals ---

    /// Run `job` on `pool`, resolving the returned future with `Timeout` if
    /// `config.timeout` elapses first. The job itself is not interrupted (there is
    /// no safe way to abort a blocking syscall); it keeps running to completion but
    /// its result is discarded once the caller has already seen `Timeout`.
    fn submit_with_timeout<T, F>(self: &Arc<Self>, pool: &WorkerPool, job: F) -> LrfFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> LrfResult<T> + Send + 'static,
    {
        let (inner_future, inner_slot) = future::pair();
        if pool.submit(move || inner_slot.resolve(job())).is_err() {
            let (outer_future, outer_slot) = future::pair();
            outer_slot.resolve(Err(LrfError::ShuttingDown));
            return outer_future;
        }

        let (outer_future, outer_slot) = future::pair();
        let timeout = self.config.timeout;
        std::thread::Builder::new()
            .name("lrf-manager-timeout".to_string())
            .spawn(move || outer_slot.resolve(inner_future.wait_timeout(timeout)))
            .expect("failed to spawn timeout supervisor thread");
        outer_future
    }

    fn get_or_open(self: &Arc<Self>, path: &Path) -> LrfResult<Arc<RegionComponents>> {
        let normalized = normalize_path(path)?;
        let mut regions = self.regions.lock().unwrap();
        if let Some(existing) = regions.get(&normalized) {
            return Ok(Arc::clone(existing));
        }
        let comps = Arc::new(self.open_region(&normalized)?);
        regions.insert(normalized, Arc::clone(&comps));
        Ok(comps)
    }

    fn open_region(&self, path: &Path) -> LrfResult<RegionComponents> {
        debug!(path = %path.display(), "opening region");
        let region = SharedRegion::open(path, self.config.default_compression)?;

        let integrity: Option<Arc<IntegrityValidator>> = if self.config.integrity.enabled {
            Some(Arc::new(IntegrityValidator::open(
                path,
                self.config.integrity.primary_algorithm,
                self.config.integrity.backup_algorithm,
            )?))
        } else {
            None
        };

        let mmap = if self.config.mmap.enabled {
            Some(Arc::new(MmapEngine::new(Arc::clone(&region), self.config.mmap.clone())))
        } else {
            None
        };

        let saver = if self.config.batch.enabled {
            let writer = RegionWriter::new(Arc::clone(&region));
            let hook: PostFlushHook = {
                let region_for_hook = Arc::clone(&region);
                let integrity_for_hook = integrity.clone();
                let mmap_for_hook = mmap.clone();
                Arc::new(move |flushed: &[(i32, i32, Vec<u8>)]| {
                    if let Some(validator) = &integrity_for_hook {
                        for (x, z, data) in flushed {
                            if let Err(error) = validator.update_checksum(*x, *z, data) {
                                warn!(x = *x, z = *z, %error, "failed to persist checksum after flush");
                            }
                        }
                    }
                    if let Some(mmap) = &mmap_for_hook {
                        for (x, z, _) in flushed {
                            mmap.invalidate(*x, *z);
                        }
                    }
                    region_for_hook.invalidate_header_cache();
                })
            };
            Some(BatchSaver::new(writer, self.config.batch.batch_size, self.config.batch.auto_flush_delay, Some(hook)))
        } else {
            None
        };

        let loader = if self.config.batch.enabled {
            let loader_reader = RegionReader::new(Arc::clone(&region));
            Some(BatchLoader::new(
                loader_reader,
                Arc::clone(&self.pools.decompress),
                self.config.batch.batch_size,
                self.config.batch.max_concurrent_loads,
            ))
        } else {
            None
        };

        Ok(RegionComponents {
            reader: Mutex::new(RegionReader::new(Arc::clone(&region))),
            sync_writer: Mutex::new(RegionWriter::new(Arc::clone(&region))),
            region,
            loader,
            saver,
            mmap,
            integrity,
        })
    }

    fn load_chunk_sync(self: &Arc<Self>, path: &Path, x: i32, z: i32, speculative: bool) -> LrfResult<Option<Vec<u8>>> {
        let comps = self.get_or_open(path)?;

        // The pending map must be consulted before the mmap engine: a write that
        // hasn't flushed yet has no durable bytes for the mmap path to decode, so
        // checking mmap first would either miss it or (worse) serve whatever was
        // cached from before the write (spec §4.7/§4.8 read-your-writes).
        if let Some(saver) = &comps.saver {
            if let Some(data) = saver.get_pending_chunk(x, z) {
                self.record_load(&Some(data.clone()));
                return Ok(Some(data));
            }
        }

        if let Some(mmap) = &comps.mmap {
            let prefetch_pool = if self.prefetch_suspended.load(Ordering::Acquire) {
                None
            } else {
                Some(self.pools.prefetch.as_ref())
            };
            if let Some(data) = mmap.read_chunk(x, z, prefetch_pool)? {
                let validated = self.validate_or_repair(&comps, path, x, z, data, speculative);
                self.record_load(&validated);
                return Ok(validated);
            }
        }

        if let Some(loader) = &comps.loader {
            let loaded = loader.load_chunk(x, z).wait()?;
            let validated = loaded.and_then(|d| self.validate_or_repair(&comps, path, x, z, d, speculative));
            self.record_load(&validated);
            return Ok(validated);
        }

        let loaded = retry_recoverable(|| comps.reader.lock().unwrap().read_chunk(x, z))?;
        let validated = loaded.and_then(|d| self.validate_or_repair(&comps, path, x, z, d, speculative));
        self.record_load(&validated);
        Ok(validated)
    }

    fn save_chunk_sync(self: &Arc<Self>, path: &Path, x: i32, z: i32, data: Vec<u8>) -> LrfResult<()> {
        let comps = self.get_or_open(path)?;
        if let Some(saver) = &comps.saver {
            saver.save_chunk(x, z, data).wait()
        } else {
            let result = retry_recoverable(|| comps.sync_writer.lock().unwrap().write_chunk(x, z, &data).map(|_| ()));
            // With batching disabled there's no pending map to shadow a stale mmap
            // read, so the direct write path must invalidate the mmap cache itself.
            if result.is_ok() {
                if let Some(mmap) = &comps.mmap {
                    mmap.invalidate(x, z);
                }
            }
            result
        }
    }

    /// Apply the integrity report for a freshly read chunk: pass valid/unrecorded
    /// data through, and on mismatch either discard it or attempt one repair
    /// (never both, and never for a speculative/prefetch read; spec §4.9).
    fn validate_or_repair(
        &self,
        comps: &RegionComponents,
        path: &Path,
        x: i32,
        z: i32,
        data: Vec<u8>,
        speculative: bool,
    ) -> Option<Vec<u8>> {
        let Some(validator) = &comps.integrity else { return Some(data) };
        match validator.validate_chunk(x, z, &data, speculative) {
            IntegrityReport::Valid | IntegrityReport::MissingChecksum => Some(data),
            IntegrityReport::CorruptedPrimary | IntegrityReport::CorruptedBoth => {
                warn!(x, z, path = %path.display(), "chunk failed integrity validation");
                if speculative || !self.config.integrity.auto_repair {
                    return None;
                }
                match repair::repair_chunk(path, x, z, repair::IssueCode::DataTruncated) {
                    Ok(Some(repaired)) => {
                        debug!(x, z, "repaired chunk via repair heuristic after integrity failure");
                        Some(repaired)
                    }
                    _ => None,
                }
            }
        }
    }

    fn record_load(&self, data: &Option<Vec<u8>>) {
        if let Some(data) = data {
            self.pressure.record_allocated(data.len() as u64);
        }
    }

    fn spawn_pressure_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("lrf-manager-pressure".to_string())
            .spawn(move || loop {
                std::thread::sleep(PRESSURE_TICK);
                let Some(this) = weak.upgrade() else { break };
                if this.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                this.apply_pressure_policy();
            })
            .expect("failed to spawn pressure monitor thread");
        *self.pressure_monitor.lock().unwrap() = Some(handle);
    }

    /// Act on the current pressure band (spec §5): shrink cache admission above
    /// 0.7, halve the load/prefetch pools above 0.8, suspend prefetch above 0.9.
    fn apply_pressure_policy(&self) {
        let level = self.pressure.level();
        self.prefetch_suspended.store(level.suspend_prefetch(), Ordering::Release);

        let (target_load, target_prefetch) = if level.halve_load_and_prefetch_pools() {
            ((LOAD_POOL_SIZE / 2).max(1), (PREFETCH_POOL_SIZE / 2).max(1))
        } else {
            (LOAD_POOL_SIZE, PREFETCH_POOL_SIZE)
        };
        self.pools.load.resize(target_load);
        self.pools.prefetch.resize(target_prefetch);

        if level.shrink_cache_admission() {
            let regions = self.regions.lock().unwrap();
            for comps in regions.values() {
                if let Some(mmap) = &comps.mmap {
                    mmap.shrink_admission_under_pressure();
                }
                comps.reader.lock().unwrap().shrink_admission_under_pressure();
            }
        }
    }
}

/// Resolve `path` to an absolute, lexically-normalized path without touching the
/// filesystem — `canonicalize()` requires the path to already exist, which a
/// not-yet-created region never does.
fn normalize_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() { path.to_path_buf() } else { std::env::current_dir()?.join(path) };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Retry a recoverable I/O failure with exponential backoff (spec §7: 100 ms,
/// 200 ms, 400 ms, 800 ms, capped at 2 s, at most 3 attempts). Non-recoverable
/// errors and non-I/O errors propagate on the first attempt.
fn retry_recoverable<T>(mut op: impl FnMut() -> LrfResult<T>) -> LrfResult<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(LrfError::Io(error)) if attempt + 1 < IO_RETRY_MAX_ATTEMPTS && is_recoverable_io(&error) => {
                let delay = (IO_RETRY_BASE_DELAY * 2u32.pow(attempt)).min(IO_RETRY_MAX_DELAY);
                warn!(attempt, ?delay, %error, "retrying recoverable I/O error");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}

/// `ENOSPC` (28), `EBUSY` (16), and `EMFILE` (24) are matched by raw errno on
/// Unix, mirroring the Linux-only deployment target; `WouldBlock`/`Interrupted`/
/// `TimedOut` are the portable `ErrorKind`s the rest of the crate already matches
/// on (see `mc173-server::net`).
fn is_recoverable_io(error: &io::Error) -> bool {
    if matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut) {
        return true;
    }
    matches!(error.raw_os_error(), Some(28) | Some(16) | Some(24))
}
