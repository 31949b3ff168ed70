//! Configuration surface for the storage engine (spec §6).
//!
//! Plain structs with `Default` impls encoding the literal defaults from the
//! option table; no environment-variable plumbing is attempted here, since
//! hosting a configuration system is out of scope for this crate (the embedding
//! application is expected to populate `Config` from whatever source it uses).

use std::time::Duration;

use crate::codec::CompressionId;
use crate::integrity::Algorithm;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub auto_flush_delay: Duration,
    pub max_concurrent_loads: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 32,
            auto_flush_delay: Duration::from_millis(500),
            max_concurrent_loads: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MmapConfig {
    pub enabled: bool,
    pub max_cache_entries: usize,
    pub max_memory_usage_bytes: u64,
    pub prefetch_distance: i32,
    pub predictive_enabled: bool,
    pub prediction_scale: i32,
}

impl Default for MmapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_entries: 512,
            max_memory_usage_bytes: 512 * 1024 * 1024,
            prefetch_distance: 8,
            predictive_enabled: true,
            prediction_scale: 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityConfig {
    pub enabled: bool,
    pub primary_algorithm: Algorithm,
    pub backup_algorithm: Algorithm,
    pub auto_repair: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_algorithm: Algorithm::Crc32c,
            backup_algorithm: Algorithm::None,
            auto_repair: true,
        }
    }
}

/// Top-level configuration for a [`crate::manager::StorageManager`].
#[derive(Debug, Clone)]
pub struct Config {
    pub batch: BatchConfig,
    pub mmap: MmapConfig,
    pub integrity: IntegrityConfig,
    pub timeout: Duration,
    pub default_compression: CompressionId,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            mmap: MmapConfig::default(),
            integrity: IntegrityConfig::default(),
            timeout: Duration::from_secs(5),
            default_compression: CompressionId::Zstd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_option_table() {
        let config = Config::default();
        assert_eq!(config.batch.batch_size, 32);
        assert_eq!(config.batch.auto_flush_delay, Duration::from_millis(500));
        assert_eq!(config.batch.max_concurrent_loads, 64);
        assert_eq!(config.mmap.max_cache_entries, 512);
        assert_eq!(config.mmap.max_memory_usage_bytes, 512 * 1024 * 1024);
        assert_eq!(config.mmap.prefetch_distance, 8);
        assert_eq!(config.mmap.prediction_scale, 6);
        assert!(config.integrity.auto_repair);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }
}
