//! Generic worker pool: a bounded job queue serviced by a fixed set of named
//! threads, grounded directly on `mc173::storage::ChunkStorage`'s
//! `StorageWorker`/`TerrainWorker` request/reply pattern and
//! `mc173-server::net::Network`'s poll/command threads.
//!
//! `StorageManager` owns five of these — load, write, compress, decompress,
//! prefetch (spec §4.10, §5) — each independently resizable as the memory
//! pressure monitor's band changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::LrfError;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Run(Job),
    Stop,
}

/// A named pool of worker threads pulling jobs off a shared bounded channel.
pub struct WorkerPool {
    name: String,
    tx: Sender<Task>,
    rx: Receiver<Task>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool named `name` with `initial_size` worker threads and a job
    /// queue bounded at `queue_capacity`.
    pub fn new(name: impl Into<String>, initial_size: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = bounded(queue_capacity.max(1));
        let pool = Self {
            name: name.into(),
            tx,
            rx,
            workers: Mutex::new(Vec::new()),
            size: AtomicUsize::new(0),
        };
        pool.spawn(initial_size);
        pool
    }

    fn spawn(&self, count: usize) {
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..count {
            let idx = workers.len();
            let rx = self.rx.clone();
            let handle = thread::Builder::new()
                .name(format!("lrf-{}-{idx}", self.name))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        match task {
                            Task::Run(job) => job(),
                            Task::Stop => break,
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        self.size.fetch_add(count, Ordering::AcqRel);
    }

    /// Submit a job. Fails with `ShuttingDown` once the pool has been shut down.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) -> Result<(), LrfError> {
        self.tx.send(Task::Run(Box::new(job))).map_err(|_| LrfError::ShuttingDown)
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Grow or shrink toward `target` worker threads. Shrinking sends one `Stop`
    /// task per removed thread through the shared queue rather than killing
    /// threads directly, so in-flight jobs ahead of the stop signal still run
    /// (spec §5 "scale down under memory pressure").
    pub fn resize(&self, target: usize) {
        let current = self.size();
        if target > current {
            self.spawn(target - current);
        } else if target < current {
            let removing = current - target;
            debug!(pool = %self.name, from = current, to = target, "shrinking worker pool");
            for _ in 0..removing {
                let _ = self.tx.send(Task::Stop);
            }
            self.size.fetch_sub(removing, Ordering::AcqRel);
        }
    }

    /// Stop every worker thread and join them. Blocks until all queued jobs ahead
    /// of the stop signals have drained.
    pub fn shutdown(&self) {
        let size = self.size.swap(0, Ordering::AcqRel);
        for _ in 0..size {
            let _ = self.tx.send(Task::Stop);
        }
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Like [`Self::shutdown`], but gives up waiting after `timeout` instead of
    /// blocking forever. A safe thread-join has no way to forcibly interrupt a
    /// worker mid-task, so on timeout the worker threads are simply left to drain
    /// in the background rather than joined; this returns `false` to let the
    /// caller log it (spec §4.10 "on timeout, interrupt outstanding tasks").
    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        let size = self.size.swap(0, Ordering::AcqRel);
        for _ in 0..size {
            let _ = self.tx.send(Task::Stop);
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        let (done_tx, done_rx) = bounded(1);
        let name = self.name.clone();
        thread::Builder::new()
            .name(format!("lrf-{name}-shutdown-joiner"))
            .spawn(move || {
                for handle in handles {
                    let _ = handle.join();
                }
                let _ = done_tx.send(());
            })
            .expect("failed to spawn shutdown joiner thread");

        match done_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(_) => {
                warn!(pool = %self.name, ?timeout, "pool shutdown timed out, worker threads left to drain");
                false
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
