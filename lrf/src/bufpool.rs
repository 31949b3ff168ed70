//! Buffer pool: reusable `Vec<u8>` scratch buffers for codec and mmap decode paths,
//! bounded by total resident bytes rather than entry count (spec §9).
//!
//! Acquiring under contention never blocks: if no pooled buffer of sufficient
//! capacity is free, a fresh one is allocated and simply not returned to the pool
//! if doing so would exceed the byte budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_total_bytes: usize,
    free_bytes: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_total_bytes: usize) -> Self {
        Self { free: Mutex::new(Vec::new()), max_total_bytes, free_bytes: AtomicUsize::new(0) }
    }

    /// Borrow a buffer with at least `min_capacity` bytes of capacity, cleared to
    /// length zero.
    pub fn acquire(&self, min_capacity: usize) -> PooledBuffer<'_> {
        let mut free = self.free.lock().unwrap();
        if let Some(pos) = free.iter().position(|b| b.capacity() >= min_capacity) {
            let mut buf = free.swap_remove(pos);
            self.free_bytes.fetch_sub(buf.capacity(), Ordering::AcqRel);
            buf.clear();
            return PooledBuffer { buf: Some(buf), pool: self };
        }
        drop(free);
        PooledBuffer { buf: Some(Vec::with_capacity(min_capacity)), pool: self }
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Acquire)
    }

    fn release(&self, buf: Vec<u8>) {
        let cap = buf.capacity();
        let mut free = self.free.lock().unwrap();
        let current = self.free_bytes.load(Ordering::Acquire);
        if current + cap <= self.max_total_bytes {
            self.free_bytes.fetch_add(cap, Ordering::AcqRel);
            free.push(buf);
        }
        // Otherwise drop it: pool is at its byte budget.
    }
}

/// A borrowed buffer, returned to its pool on drop (unless doing so would exceed
/// the pool's byte budget, in which case it is simply freed).
pub struct PooledBuffer<'a> {
    buf: Option<Vec<u8>>,
    pool: &'a BufferPool,
}

impl std::ops::Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_buffer() {
        let pool = BufferPool::new(1024);
        {
            let mut buf = pool.acquire(64);
            buf.extend_from_slice(&[1, 2, 3]);
        }
        assert!(pool.free_bytes() >= 64);
        let buf = pool.acquire(32);
        assert!(buf.is_empty());
    }

    #[test]
    fn over_budget_buffers_are_not_retained() {
        let pool = BufferPool::new(16);
        {
            let _buf = pool.acquire(1024);
        }
        assert_eq!(pool.free_bytes(), 0);
    }

    #[test]
    fn acquire_falls_back_to_fresh_allocation_when_none_fit() {
        let pool = BufferPool::new(1024);
        let first = pool.acquire(8);
        drop(first);
        let second = pool.acquire(512);
        assert!(second.capacity() >= 512);
    }
}
