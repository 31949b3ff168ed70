//! Channel-backed handle standing in for the engine's asynchronous operations
//! (spec §5, §9).
//!
//! The teacher never reaches for an async runtime, so neither do we: a
//! [`LrfFuture`] is just the receiving half of a one-shot `crossbeam_channel`
//! channel plus a shared cancellation flag, the same shape as
//! `ChunkStorage`'s request/reply handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::LrfError;

/// A handle to a value that a worker thread will produce later.
pub struct LrfFuture<T> {
    rx: Receiver<Result<T, LrfError>>,
    cancel: Arc<AtomicBool>,
}

/// The producing side, held by whichever worker will eventually resolve this
/// future.
pub struct LrfFutureSlot<T> {
    tx: Sender<Result<T, LrfError>>,
    cancel: Arc<AtomicBool>,
}

/// Build a connected future/slot pair.
pub fn pair<T>() -> (LrfFuture<T>, LrfFutureSlot<T>) {
    let (tx, rx) = bounded(1);
    let cancel = Arc::new(AtomicBool::new(false));
    (
        LrfFuture { rx, cancel: Arc::clone(&cancel) },
        LrfFutureSlot { tx, cancel },
    )
}

impl<T> LrfFuture<T> {
    /// Block until the value arrives or the worker side is dropped without
    /// resolving it.
    pub fn wait(self) -> Result<T, LrfError> {
        self.rx.recv().unwrap_or(Err(LrfError::ShuttingDown))
    }

    /// Block up to `timeout`, returning `LrfError::Timeout` if it elapses first.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, LrfError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(LrfError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(LrfError::ShuttingDown),
        }
    }

    /// Request cancellation. A worker already mid-chunk finishes that chunk
    /// before observing the flag; cancellation is checked only at safe
    /// checkpoints between chunks, never mid-codec-call (spec §5).
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

impl<T> LrfFutureSlot<T> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Resolve the future. Ignores a disconnected receiver (the caller gave up).
    pub fn resolve(self, result: Result<T, LrfError>) {
        let _ = self.tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolves_across_threads() {
        let (future, slot) = pair::<u32>();
        thread::spawn(move || slot.resolve(Ok(42)));
        assert_eq!(future.wait().unwrap(), 42);
    }

    #[test]
    fn timeout_without_resolution() {
        let (future, _slot) = pair::<u32>();
        let err = future.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, LrfError::Timeout));
    }

    #[test]
    fn cancel_flag_is_observed_by_slot() {
        let (future, slot) = pair::<u32>();
        future.cancel();
        assert!(slot.is_cancelled());
        slot.resolve(Err(LrfError::Cancelled));
        assert!(matches!(future.wait(), Err(LrfError::Cancelled)));
    }

    #[test]
    fn dropped_slot_yields_shutting_down() {
        let (future, slot) = pair::<u32>();
        drop(slot);
        assert!(matches!(future.wait(), Err(LrfError::ShuttingDown)));
    }
}
