//! Batch saver: buffers writes per region and flushes them together on a size,
//! delay, or explicit trigger (spec §4.7).
//!
//! The pending map backs `has_pending_chunk`/`get_pending_chunk` so readers get
//! read-your-writes behavior during the buffering window. On flush, entries are
//! removed from the pending map *before* the post-flush hook runs, so a reader
//! racing the hook sees either the old pending value or the newly durable one,
//! never a gap.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tracing::debug;

use crate::error::LrfError;
use crate::future::{self, LrfFuture, LrfFutureSlot};
use crate::writer::RegionWriter;

/// Invoked once per flushed batch (not once per chunk) with `(x, z, raw bytes)`
/// for every chunk that was durably written, so the caller can update checksums
/// and invalidate cached header state in one pass (spec §4.7).
pub type PostFlushHook = Arc<dyn Fn(&[(i32, i32, Vec<u8>)]) + Send + Sync>;

/// How often the auto-flush monitor thread wakes to check the delay trigger.
const MONITOR_TICK: Duration = Duration::from_millis(25);

#[derive(Default)]
struct PendingState {
    entries: IndexMap<(i32, i32), Vec<u8>>,
    waiters: std::collections::HashMap<(i32, i32), Vec<LrfFutureSlot<()>>>,
    first_inserted: Option<Instant>,
}

pub struct BatchSaver {
    writer: Mutex<RegionWriter>,
    pending: Mutex<PendingState>,
    batch_size: usize,
    auto_flush_delay: Duration,
    post_flush_hook: Option<PostFlushHook>,
    shutdown: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BatchSaver {
    pub fn new(
        writer: RegionWriter,
        batch_size: usize,
        auto_flush_delay: Duration,
        post_flush_hook: Option<PostFlushHook>,
    ) -> Arc<Self> {
        let saver = Arc::new(Self {
            writer: Mutex::new(writer),
            pending: Mutex::new(PendingState::default()),
            batch_size: batch_size.max(1),
            auto_flush_delay,
            post_flush_hook,
            shutdown: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
        });
        saver.spawn_monitor();
        saver
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let weak: Weak<BatchSaver> = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("lrf-batch-saver-monitor".to_string())
            .spawn(move || loop {
                std::thread::sleep(MONITOR_TICK);
                let Some(this) = weak.upgrade() else { break };
                if this.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let should_flush = {
                    let pending = this.pending.lock().unwrap();
                    pending
                        .first_inserted
                        .is_some_and(|first| first.elapsed() >= this.auto_flush_delay)
                };
                if should_flush {
                    this.flush_batch();
                }
            })
            .expect("failed to spawn batch saver monitor thread");
        *self.monitor.lock().unwrap() = Some(handle);
    }

    /// Buffer a chunk's bytes; triggers an immediate flush once the pending count
    /// reaches `batch_size` (spec §4.7 trigger (a)).
    pub fn save_chunk(self: &Arc<Self>, x: i32, z: i32, data: Vec<u8>) -> LrfFuture<()> {
        let (future, slot) = future::pair();
        let should_flush = {
            let mut pending = self.pending.lock().unwrap();
            pending.entries.insert((x, z), data);
            pending.waiters.entry((x, z)).or_default().push(slot);
            if pending.first_inserted.is_none() {
                pending.first_inserted = Some(Instant::now());
            }
            pending.entries.len() >= self.batch_size
        };
        if should_flush {
            self.flush_batch();
        }
        future
    }

    pub fn has_pending_chunk(&self, x: i32, z: i32) -> bool {
        self.pending.lock().unwrap().entries.contains_key(&(x, z))
    }

    pub fn get_pending_chunk(&self, x: i32, z: i32) -> Option<Vec<u8>> {
        self.pending.lock().unwrap().entries.get(&(x, z)).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().entries.len()
    }

    /// Flush every pending entry now (spec §4.7 trigger (c), `flushBatch()`).
    ///
    /// Entries stay in the pending map for the whole disk write — only *snapshot*
    /// (clone) them up front — and are removed only once the write is durable, so
    /// a concurrent `get_pending_chunk`/`has_pending_chunk` never sees a gap
    /// between "drained from pending" and "visible on disk" (spec §4.7, §9's
    /// insert-then-flush-then-remove ordering).
    pub fn flush_batch(&self) {
        let (snapshot, mut waiters) = {
            let mut pending = self.pending.lock().unwrap();
            if pending.entries.is_empty() {
                return;
            }
            let snapshot: Vec<((i32, i32), Vec<u8>)> = pending.entries.iter().map(|(&k, v)| (k, v.clone())).collect();
            let waiters = std::mem::take(&mut pending.waiters);
            pending.first_inserted = None;
            (snapshot, waiters)
        };

        debug!(count = snapshot.len(), "flushing batch");

        let results = {
            let mut writer = self.writer.lock().unwrap();
            for ((x, z), data) in &snapshot {
                writer.queue_chunk(*x, *z, data.clone());
            }
            writer.flush_batch()
        };

        let results = results.unwrap_or_else(|_| snapshot.iter().map(|_| Err(flush_io_error())).collect());

        // Remove exactly the entries just made durable, and only if nothing
        // re-saved that coordinate while the write was in flight — a fresher
        // pending write must survive to be picked up by its own flush.
        {
            let mut pending = self.pending.lock().unwrap();
            for (key, data) in &snapshot {
                if pending.entries.get(key) == Some(data) {
                    pending.entries.shift_remove(key);
                }
            }
        }

        let mut successes = Vec::new();
        for (((x, z), data), result) in snapshot.into_iter().zip(results.iter()) {
            if let Some(slots) = waiters.remove(&(x, z)) {
                for slot in slots {
                    match result {
                        Ok(_) => slot.resolve(Ok(())),
                        Err(_) => slot.resolve(Err(flush_io_error())),
                    }
                }
            }
            if result.is_ok() {
                successes.push((x, z, data));
            }
        }

        if !successes.is_empty() {
            if let Some(hook) = &self.post_flush_hook {
                hook(&successes);
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.flush_batch();
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn flush_io_error() -> LrfError {
    LrfError::Io(io::Error::other("batch flush failed for one or more chunks"))
}
