//! Memory pressure monitor: tracks a `used / max` ratio and classifies it into the
//! response bands the manager and caches react to (spec §5).
//!
//! At >0.7 caches should shrink admission to half their configured capacity; at
//! >0.8 the load and prefetch pools should be halved; at >0.9 prefetching should
//! be suspended entirely. This module only reports the band; acting on it is the
//! caller's job (`StorageManager`, `MmapEngine`, `RegionReader`).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl PressureLevel {
    /// Caches should admit at half their configured capacity or less.
    pub fn shrink_cache_admission(self) -> bool {
        !matches!(self, PressureLevel::Normal)
    }

    /// Load/prefetch pools should be resized to half their configured size.
    pub fn halve_load_and_prefetch_pools(self) -> bool {
        matches!(self, PressureLevel::High | PressureLevel::Critical)
    }

    /// Prefetch tasks should not be enqueued at all.
    pub fn suspend_prefetch(self) -> bool {
        matches!(self, PressureLevel::Critical)
    }
}

/// Tracks approximate memory use against a configured ceiling. Callers report
/// allocations and frees as they happen; this is a best-effort accounting, not an
/// exact allocator hook.
#[derive(Debug)]
pub struct PressureMonitor {
    used_bytes: AtomicU64,
    max_bytes: u64,
}

impl PressureMonitor {
    pub fn new(max_bytes: u64) -> Self {
        Self { used_bytes: AtomicU64::new(0), max_bytes: max_bytes.max(1) }
    }

    pub fn record_allocated(&self, bytes: u64) {
        self.used_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_freed(&self, bytes: u64) {
        self.used_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(bytes)))
            .ok();
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn ratio(&self) -> f64 {
        self.used_bytes() as f64 / self.max_bytes as f64
    }

    pub fn level(&self) -> PressureLevel {
        let ratio = self.ratio();
        if ratio > 0.9 {
            PressureLevel::Critical
        } else if ratio > 0.8 {
            PressureLevel::High
        } else if ratio > 0.7 {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_match_spec_thresholds() {
        let monitor = PressureMonitor::new(1000);
        assert_eq!(monitor.level(), PressureLevel::Normal);

        monitor.record_allocated(750);
        assert_eq!(monitor.level(), PressureLevel::Elevated);
        assert!(monitor.level().shrink_cache_admission());
        assert!(!monitor.level().halve_load_and_prefetch_pools());

        monitor.record_allocated(60);
        assert_eq!(monitor.level(), PressureLevel::High);
        assert!(monitor.level().halve_load_and_prefetch_pools());
        assert!(!monitor.level().suspend_prefetch());

        monitor.record_allocated(110);
        assert_eq!(monitor.level(), PressureLevel::Critical);
        assert!(monitor.level().suspend_prefetch());
    }

    #[test]
    fn record_freed_saturates_at_zero() {
        let monitor = PressureMonitor::new(100);
        monitor.record_allocated(10);
        monitor.record_freed(50);
        assert_eq!(monitor.used_bytes(), 0);
    }
}
