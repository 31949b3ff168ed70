//! Batch loader: coalesces concurrent reads for the same coordinate into a single
//! in-flight operation and groups bulk requests into windows handed to the shared
//! decompression pool (spec §4.6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::trace;

use crate::error::LrfError;
use crate::future::{self, LrfFuture, LrfFutureSlot};
use crate::pool::WorkerPool;
use crate::reader::RegionReader;

type PendingSlots = Vec<LrfFutureSlot<Option<Vec<u8>>>>;

/// Coalesces reads for one region, single-flight per coordinate.
pub struct BatchLoader {
    reader: Mutex<RegionReader>,
    decompress_pool: Arc<WorkerPool>,
    batch_size: usize,
    pending: Mutex<HashMap<(i32, i32), PendingSlots>>,
    permits_tx: Sender<()>,
    permits_rx: Receiver<()>,
}

impl BatchLoader {
    pub fn new(reader: RegionReader, decompress_pool: Arc<WorkerPool>, batch_size: usize, max_concurrent: usize) -> Arc<Self> {
        let (permits_tx, permits_rx) = bounded(max_concurrent.max(1));
        for _ in 0..max_concurrent.max(1) {
            let _ = permits_tx.send(());
        }
        Arc::new(Self {
            reader: Mutex::new(reader),
            decompress_pool,
            batch_size: batch_size.max(1),
            pending: Mutex::new(HashMap::new()),
            permits_tx,
            permits_rx,
        })
    }

    /// Load one chunk. A second concurrent call for the same coordinate receives a
    /// future resolving from the same underlying read, not a duplicate one (spec
    /// §4.6 "single-flight").
    pub fn load_chunk(self: &Arc<Self>, x: i32, z: i32) -> LrfFuture<Option<Vec<u8>>> {
        let (future, slot) = future::pair();
        let key = (x, z);

        let mut pending = self.pending.lock().unwrap();
        if let Some(slots) = pending.get_mut(&key) {
            trace!(x, z, "coalescing into in-flight load");
            slots.push(slot);
            return future;
        }
        pending.insert(key, Vec::new());
        drop(pending);

        // If the pool has already shut down, `slot` is dropped along with the
        // rejected job; the disconnected channel makes `future.wait()` return
        // `LrfError::ShuttingDown` on its own, so no separate fallback is needed.
        let this = Arc::clone(self);
        let _ = self.decompress_pool.submit(move || this.run_load(x, z, slot));
        future
    }

    /// Load a list of coordinates, dispatched in windows of `batch_size` to the
    /// decompression pool, preserving the caller's requested order in the result
    /// (spec §4.6 "windows of up to batchSize").
    pub fn load_chunks(self: &Arc<Self>, coords: Vec<(i32, i32)>) -> LrfFuture<Vec<Option<Vec<u8>>>> {
        let (future, slot) = future::pair();
        let this = Arc::clone(self);

        std::thread::Builder::new()
            .name("lrf-batch-loader-gather".to_string())
            .spawn(move || {
                let mut per_coord_futures = Vec::with_capacity(coords.len());
                for window in coords.chunks(this.batch_size) {
                    for &(x, z) in window {
                        per_coord_futures.push(this.load_chunk(x, z));
                    }
                }
                let mut results = Vec::with_capacity(per_coord_futures.len());
                for f in per_coord_futures {
                    results.push(f.wait().unwrap_or(None));
                }
                slot.resolve(Ok(results));
            })
            .expect("failed to spawn gather thread");

        future
    }

    fn run_load(&self, x: i32, z: i32, primary_slot: LrfFutureSlot<Option<Vec<u8>>>) {
        // Acquire a concurrency permit; blocks (applies backpressure) once
        // `max_concurrent` loads are already outstanding (spec §5 "Backpressure").
        let _permit = self.permits_rx.recv();

        let result = self.reader.lock().unwrap().read_chunk(x, z);

        let waiters = self.pending.lock().unwrap().remove(&(x, z)).unwrap_or_default();

        let result: Result<Option<Vec<u8>>, LrfError> = result;
        match &result {
            Ok(value) => {
                primary_slot.resolve(Ok(value.clone()));
                for waiter in waiters {
                    waiter.resolve(Ok(value.clone()));
                }
            }
            Err(_) => {
                // LrfError is not Clone; re-derive a fresh error per waiter so
                // nothing panics trying to clone it.
                primary_slot.resolve(result);
                for waiter in waiters {
                    waiter.resolve(self.reader.lock().unwrap().read_chunk(x, z));
                }
            }
        }

        let _ = self.permits_tx.send(());
    }

    pub fn outstanding_permits_available(&self) -> usize {
        self.permits_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionId;
    use crate::resource::SharedRegion;
    use crate::writer::RegionWriter;

    fn setup() -> (Arc<BatchLoader>, Arc<SharedRegion>) {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedRegion::open(dir.path().join("r.0.0.lrf"), CompressionId::None).unwrap();
        let mut writer = RegionWriter::new(Arc::clone(&region));
        writer.write_chunk(1, 1, b"loader payload").unwrap();
        writer.flush().unwrap();

        let reader = RegionReader::new(Arc::clone(&region));
        let pool = Arc::new(WorkerPool::new("test-decompress", 4, 64));
        (BatchLoader::new(reader, pool, 32, 64), region)
    }

    #[test]
    fn loads_an_existing_chunk() {
        let (loader, _region) = setup();
        let data = loader.load_chunk(1, 1).wait().unwrap();
        assert_eq!(data, Some(b"loader payload".to_vec()));
    }

    #[test]
    fn missing_chunk_resolves_to_none() {
        let (loader, _region) = setup();
        let data = loader.load_chunk(9, 9).wait().unwrap();
        assert_eq!(data, None);
    }

    #[test]
    fn concurrent_loads_for_same_coordinate_both_resolve() {
        let (loader, _region) = setup();
        let first = loader.load_chunk(1, 1);
        let second = loader.load_chunk(1, 1);
        assert_eq!(first.wait().unwrap(), second.wait().unwrap());
    }

    #[test]
    fn load_chunks_preserves_order() {
        let (loader, _region) = setup();
        let results = loader.load_chunks(vec![(1, 1), (9, 9), (1, 1)]).wait().unwrap();
        assert_eq!(results, vec![Some(b"loader payload".to_vec()), None, Some(b"loader payload".to_vec())]);
    }
}
