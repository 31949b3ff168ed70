//! Shared region resource: the single owner of a region's file handle and optional
//! memory mapping (spec §3, §4.3).
//!
//! One instance exists per normalized absolute path, reference-counted so readers,
//! writers, the batch loader/saver and the mmap engine can all borrow the same
//! handle instead of opening the file repeatedly. Mutation of the file's write
//! position is serialized through a `RwLock` (spec §5): reads take the shared lock,
//! writes take the exclusive lock. The cached [`Header`] snapshot has a 2-second TTL
//! and is also invalidated explicitly by the post-flush hook.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::codec::CompressionId;
use crate::constants::HEADER_SIZE;
use crate::error::LrfError;
use crate::header::Header;

const HEADER_CACHE_TTL: Duration = Duration::from_secs(2);

/// Metadata used to decide whether the cached header snapshot is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileFingerprint {
    len: u64,
    modified_nanos: u128,
}

struct CachedHeader {
    header: Arc<Header>,
    built_at: Instant,
    fingerprint: FileFingerprint,
}

/// A file handle, optional mmap view, and cached header shared by every component
/// operating on one region path.
pub struct SharedRegion {
    path: PathBuf,
    file: RwLock<File>,
    /// Serializes appenders and header-mutating writers; see spec §3 "Exactly one
    /// writer may mutate the header of a region at a time".
    write_lock: Mutex<()>,
    mmap: RwLock<Option<Arc<Mmap>>>,
    cached_header: Mutex<Option<CachedHeader>>,
    ref_count: AtomicUsize,
}

impl SharedRegion {
    /// Open (creating if necessary) the region file at `path`, initializing an empty
    /// header if the file is new.
    pub fn open(path: impl AsRef<Path>, create_default_compression: CompressionId) -> io::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            let header = Header::empty(create_default_compression);
            let mut buf = vec![0u8; HEADER_SIZE];
            header.write(&mut buf);
            file.write_all(&buf)?;
            file.flush()?;
        } else if len < HEADER_SIZE as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("region file {} is smaller than the header", path.display()),
            ));
        }

        Ok(Arc::new(Self {
            path,
            file: RwLock::new(file),
            write_lock: Mutex::new(()),
            mmap: RwLock::new(None),
            cached_header: Mutex::new(None),
            ref_count: AtomicUsize::new(1),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Increment the reference count; pairs with [`Self::release`].
    pub fn acquire(self: &Arc<Self>) -> Arc<Self> {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self)
    }

    /// Decrement the reference count, returning `true` if it reached zero. The
    /// caller is expected to drop its own `Arc` immediately after; this only reports
    /// whether this was logically the last user, for unmapping/closing decisions.
    pub fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    fn fingerprint(&self) -> io::Result<FileFingerprint> {
        let meta = self.file.read().unwrap().metadata()?;
        let modified_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(FileFingerprint { len: meta.len(), modified_nanos })
    }

    /// Return the current header snapshot, refreshing from disk if the TTL expired
    /// or the file's size/mtime changed since the last snapshot (spec §4.3).
    pub fn header(&self) -> Result<Arc<Header>, LrfError> {
        let fingerprint = self.fingerprint()?;
        {
            let cache = self.cached_header.lock().unwrap();
            if let Some(cached) = cache.as_ref() {
                if cached.built_at.elapsed() < HEADER_CACHE_TTL && cached.fingerprint == fingerprint {
                    return Ok(Arc::clone(&cached.header));
                }
            }
        }
        self.refresh_header(fingerprint)
    }

    fn refresh_header(&self, fingerprint: FileFingerprint) -> Result<Arc<Header>, LrfError> {
        trace!(path = %self.path.display(), "refreshing header cache");
        let mut buf = vec![0u8; HEADER_SIZE];
        {
            let mut file = self.file.write().unwrap();
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
        }
        let header = Arc::new(Header::read(&buf).map_err(LrfError::Format)?);
        let mut cache = self.cached_header.lock().unwrap();
        *cache = Some(CachedHeader { header: Arc::clone(&header), built_at: Instant::now(), fingerprint });
        Ok(header)
    }

    /// Force the next [`Self::header`] call to re-read from disk, regardless of TTL.
    pub fn invalidate_header_cache(&self) {
        *self.cached_header.lock().unwrap() = None;
    }

    /// Install a freshly mutated header as the cached snapshot without going back to
    /// disk, used by the writer right after it durably updates a slot (spec §4.5).
    pub fn install_header(&self, header: Arc<Header>) {
        if let Ok(fingerprint) = self.fingerprint() {
            *self.cached_header.lock().unwrap() =
                Some(CachedHeader { header, built_at: Instant::now(), fingerprint });
        }
    }

    /// Acquire the writer-serializing lock for the duration of an append/flush.
    pub fn lock_for_write(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap()
    }

    pub fn file(&self) -> &RwLock<File> {
        &self.file
    }

    pub fn current_len(&self) -> io::Result<u64> {
        self.file.read().unwrap().metadata().map(|m| m.len())
    }

    /// Return the current mmap view, creating or re-creating it if absent or if the
    /// file has grown since it was last mapped. Re-mapping happens under the write
    /// lock, invalidating in-flight readers, who retry at most once (spec §5).
    pub fn mmap(&self) -> io::Result<Arc<Mmap>> {
        {
            let guard = self.mmap.read().unwrap();
            if let Some(mmap) = guard.as_ref() {
                let file_len = self.current_len()?;
                if mmap.len() as u64 >= file_len {
                    return Ok(Arc::clone(mmap));
                }
            }
        }
        let _write_guard = self.write_lock.lock().unwrap();
        let file = self.file.read().unwrap();
        let mmap = Arc::new(unsafe { Mmap::map(&*file)? });
        debug!(path = %self.path.display(), len = mmap.len(), "remapped region file");
        *self.mmap.write().unwrap() = Some(Arc::clone(&mmap));
        Ok(mmap)
    }

    pub fn invalidate_mmap(&self) {
        *self.mmap.write().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_valid_empty_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let region = SharedRegion::open(&path, CompressionId::None).unwrap();
        let header = region.header().unwrap();
        assert_eq!(header.chunk_count(), 0);
        assert_eq!(region.current_len().unwrap(), HEADER_SIZE as u64);
    }

    #[test]
    fn ref_counting_reaches_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let region = SharedRegion::open(&path, CompressionId::None).unwrap();
        let second = region.acquire();
        assert_eq!(region.ref_count(), 2);
        assert!(!region.release());
        assert!(second.release());
    }

    #[test]
    fn rejects_truncated_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(SharedRegion::open(&path, CompressionId::None).is_err());
    }
}
