//! Narrow host-integration port (spec §9 "inheritance used to extend the host's
//! region-file interface").
//!
//! The original relies on subclassing a server's region-file class to intercept
//! I/O. Rather than carrying that inheritance relationship forward, this crate
//! defines the capability set a host actually needs — read, write, existence
//! check, flush, close — as a trait `StorageManager` implements. A host adapts to
//! [`RegionPort`] instead of the engine adapting to the host.

use std::path::Path;
use std::sync::Arc;

use crate::future::LrfFuture;
use crate::manager::StorageManager;

/// The capability set a host application needs from the storage engine. Nothing
/// about batching, mmap, or integrity configuration leaks through this boundary;
/// a host written against `RegionPort` alone cannot tell those components exist.
pub trait RegionPort {
    fn read_chunk(self: &Arc<Self>, path: &Path, x: i32, z: i32) -> LrfFuture<Option<Vec<u8>>>;
    fn write_chunk(self: &Arc<Self>, path: &Path, x: i32, z: i32, data: &[u8]) -> LrfFuture<()>;
    fn has_chunk(self: &Arc<Self>, path: &Path, x: i32, z: i32) -> bool;
    fn flush_region(self: &Arc<Self>, path: &Path) -> LrfFuture<()>;
    fn close_region(self: &Arc<Self>, path: &Path);
}

impl RegionPort for StorageManager {
    fn read_chunk(self: &Arc<Self>, path: &Path, x: i32, z: i32) -> LrfFuture<Option<Vec<u8>>> {
        self.load_chunk(path, x, z)
    }

    fn write_chunk(self: &Arc<Self>, path: &Path, x: i32, z: i32, data: &[u8]) -> LrfFuture<()> {
        self.save_chunk(path, x, z, data)
    }

    fn has_chunk(self: &Arc<Self>, path: &Path, x: i32, z: i32) -> bool {
        self.has_data_for(path, x, z)
    }

    fn flush_region(self: &Arc<Self>, path: &Path) -> LrfFuture<()> {
        self.flush(path)
    }

    fn close_region(self: &Arc<Self>, path: &Path) {
        StorageManager::close_region(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionId;
    use crate::config::Config;

    /// A host depending only on `RegionPort` should be able to round-trip a
    /// chunk without ever naming `StorageManager` directly.
    fn round_trip_through_port(port: &Arc<dyn RegionPort + Send + Sync>, path: &Path) {
        port.write_chunk(path, 8, 9, b"via the port").wait().unwrap();
        assert!(port.has_chunk(path, 8, 9));
        assert_eq!(port.read_chunk(path, 8, 9).wait().unwrap(), Some(b"via the port".to_vec()));
        port.flush_region(path).wait().unwrap();
    }

    #[test]
    fn storage_manager_satisfies_the_port_as_a_trait_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let mut config = Config::default();
        config.default_compression = CompressionId::None;
        let manager: Arc<dyn RegionPort + Send + Sync> = StorageManager::new(config);

        round_trip_through_port(&manager, &path);
        manager.close_region(&path);
    }
}
