//! Literal end-to-end scenarios from the region format's public API surface:
//! empty-region round trip, a single LZ4 chunk's bit-exact frame, read-your-writes
//! through the batch saver, corruption isolation between sibling chunks, batch
//! flush ordering, and mmap predictive prefetch.

use std::sync::Arc;
use std::time::Duration;

use lrf::codec::{CodecRegistry, CompressionId};
use lrf::config::{BatchConfig, Config, IntegrityConfig, MmapConfig};
use lrf::constants::HEADER_SIZE;
use lrf::manager::StorageManager;
use lrf::mmap::MmapEngine;
use lrf::pool::WorkerPool;
use lrf::resource::SharedRegion;
use lrf::writer::RegionWriter;

fn region_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("r.0.0.lrf")
}

fn manager_config() -> Config {
    Config {
        batch: BatchConfig { batch_size: 3, auto_flush_delay: Duration::from_secs(60), ..Default::default() },
        mmap: MmapConfig::default(),
        integrity: IntegrityConfig::default(),
        timeout: Duration::from_secs(5),
        default_compression: CompressionId::None,
    }
}

#[test]
fn empty_region_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let region = SharedRegion::open(region_path(&dir), CompressionId::None).unwrap();
    let mut writer = RegionWriter::new(Arc::clone(&region));
    writer.flush().unwrap();

    let bytes = std::fs::read(region.path()).unwrap();
    assert_eq!(bytes.len(), HEADER_SIZE);
    assert_eq!(&bytes[0..9], b"TURBO_LRF");
    for idx in 0..1024 {
        let off = 21 + idx * 4;
        assert_eq!(u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()), 0);
    }
}

#[test]
fn single_chunk_lz4_matches_literal_frame_layout() {
    let dir = tempfile::tempdir().unwrap();
    let region = SharedRegion::open(region_path(&dir), CompressionId::Lz4).unwrap();
    let mut writer = RegionWriter::new(Arc::clone(&region));
    writer.write_chunk(0, 0, &[0x10, 0x20, 0x30]).unwrap();
    writer.flush().unwrap();

    let bytes = std::fs::read(region.path()).unwrap();
    assert!(bytes.len() >= HEADER_SIZE + 256);

    let frame = &bytes[HEADER_SIZE..];
    // Spec §8 scenario 2: the frame starts with `0x00 0x00 0x00 L` since L is small.
    assert_eq!(&frame[0..3], &[0x00, 0x00, 0x00]);
    let declared_len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
    assert_eq!(frame[4], CompressionId::Lz4.as_u8());

    let encoded = &frame[5..declared_len];
    let decoded = CodecRegistry::new().decode(CompressionId::Lz4, encoded).unwrap();
    assert_eq!(decoded, vec![0x10, 0x20, 0x30]);

    let mut reader = lrf::reader::RegionReader::new(region);
    assert_eq!(reader.read_chunk(0, 0).unwrap(), Some(vec![0x10, 0x20, 0x30]));
}

#[test]
fn read_your_writes_through_saver_without_awaiting_the_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = region_path(&dir);
    let mut config = manager_config();
    config.batch.batch_size = 100;
    let manager = StorageManager::new(config);

    let _save_future = manager.save_chunk(&path, 5, 7, b"A");
    let loaded = manager.load_chunk(&path, 5, 7).wait().unwrap();
    assert_eq!(loaded, Some(b"A".to_vec()));

    manager.close();
}

#[test]
fn corruption_in_one_chunk_leaves_its_sibling_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = region_path(&dir);
    let mut config = manager_config();
    config.integrity.auto_repair = false;
    let manager = StorageManager::new(config);

    manager.save_chunk(&path, 0, 0, b"chunk zero zero").wait().unwrap();
    manager.save_chunk(&path, 1, 0, b"chunk one zero").wait().unwrap();
    manager.flush(&path).wait().unwrap();
    manager.close_region(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    let corrupt_at = HEADER_SIZE + 5 + 3;
    bytes[corrupt_at] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    assert_eq!(manager.load_chunk(&path, 0, 0).wait().unwrap(), None);
    assert_eq!(manager.load_chunk(&path, 1, 0).wait().unwrap(), Some(b"chunk one zero".to_vec()));

    manager.close();
}

#[test]
fn batch_flush_appends_in_submission_order_on_sector_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let path = region_path(&dir);
    let mut config = manager_config();
    config.batch.batch_size = 3;
    let manager = StorageManager::new(config);

    manager.save_chunk(&path, 0, 0, b"A");
    manager.save_chunk(&path, 1, 0, b"B");
    let last = manager.save_chunk(&path, 2, 0, b"C");
    last.wait().unwrap();

    let region = SharedRegion::open(&path, CompressionId::None).unwrap();
    let header = region.header().unwrap();
    let offset_a = header.get_offset(0, 0).unwrap();
    let offset_b = header.get_offset(1, 0).unwrap();
    let offset_c = header.get_offset(2, 0).unwrap();
    assert!(offset_a < offset_b);
    assert!(offset_b < offset_c);
    for offset in [offset_a, offset_b, offset_c] {
        assert_eq!(offset % 256, 0);
    }

    assert_eq!(manager.load_chunk(&path, 0, 0).wait().unwrap(), Some(b"A".to_vec()));
    assert_eq!(manager.load_chunk(&path, 1, 0).wait().unwrap(), Some(b"B".to_vec()));
    assert_eq!(manager.load_chunk(&path, 2, 0).wait().unwrap(), Some(b"C".to_vec()));

    manager.close();
}

#[test]
fn predictive_prefetch_admits_chunks_ahead_of_an_explicit_load() {
    let dir = tempfile::tempdir().unwrap();
    let region = SharedRegion::open(region_path(&dir), CompressionId::None).unwrap();
    let mut writer = RegionWriter::new(Arc::clone(&region));
    for i in 0..5 {
        writer.write_chunk(i, 0, format!("chunk-{i}").as_bytes()).unwrap();
    }
    writer.flush().unwrap();

    let engine = Arc::new(MmapEngine::new(Arc::clone(&region), MmapConfig::default()));
    let prefetch_pool = WorkerPool::new("e2e-prefetch", 2, 16);

    engine.read_chunk(0, 0, Some(&prefetch_pool)).unwrap();
    engine.read_chunk(1, 0, Some(&prefetch_pool)).unwrap();
    engine.read_chunk(2, 0, Some(&prefetch_pool)).unwrap();

    prefetch_pool.shutdown();
    assert!(engine.is_cached(3, 0));
    assert!(engine.is_cached(4, 0));
}
