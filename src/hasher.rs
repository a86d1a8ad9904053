//! Incremental per-file chunk hashing.
//!
//! # Overview
//!
//! A [`ChunkHasher`] computes BLAKE3 digests of geometrically growing byte
//! windows of one file, on demand, and caches each digest for the lifetime
//! of the hasher. Two equal-size files are content-identical exactly when
//! their window digests match at every level, because the windows are
//! disjoint and together cover the whole file. A mismatch at any level
//! proves inequality without reading the later (larger) windows, which
//! bounds I/O for files that differ early.
//!
//! # Window schedule
//!
//! Level 0 covers bytes `[0, 2048)`. Level `i > 0` covers
//! `[2^(10+i), 2^(10+i+1))`. Both bounds are clamped to the file size.
//! For a file whose size is an exact power of two the final level's clamped
//! window is empty; its digest is the digest of zero bytes and two such
//! windows compare equal trivially, reading nothing.
//!
//! The underlying file handle opens lazily on the first physical read and
//! can be [`close`](ChunkHasher::close)d at any time; a retained hasher
//! reopens it on the next uncached request.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::trace;

use crate::diag::Diagnostics;
use crate::error::{Error, Result};

/// A 32-byte BLAKE3 window digest.
pub type Digest = [u8; 32];

/// Default read buffer size for chunked window reads.
pub const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// Highest level the window schedule defines for a file of `size` bytes.
///
/// Derived as `floor(log2(size)) - 10`, clamped to zero. Levels
/// `0..=max_level` partition `[0, size)`. For sizes that are exact powers
/// of two the last level's clamped window is empty (see the module docs).
#[must_use]
pub fn max_level(size: u64) -> u32 {
    if size == 0 {
        0
    } else {
        size.ilog2().saturating_sub(10)
    }
}

/// Byte range `[offset, limit)` of `level` for a file of `size` bytes,
/// clamped to the file size.
#[must_use]
pub fn window(size: u64, level: u32) -> (u64, u64) {
    let offset = if level == 0 { 0 } else { pow2(10 + level) };
    let limit = pow2(11 + level);
    (offset.min(size), limit.min(size))
}

fn pow2(exp: u32) -> u64 {
    if exp >= 64 {
        u64::MAX
    } else {
        1u64 << exp
    }
}

/// Outcome of one in-flight level computation, shared with every waiter.
/// `io::Error` is not `Clone`, so failures travel as kind + message and are
/// rebuilt per waiter.
type FlightOutcome = std::result::Result<Digest, (io::ErrorKind, String)>;

#[derive(Default)]
struct Flight {
    slot: Mutex<Option<FlightOutcome>>,
    cond: Condvar,
}

impl Flight {
    fn wait(&self) -> FlightOutcome {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self.cond.wait(slot).unwrap();
        }
    }

    fn complete(&self, outcome: FlightOutcome) {
        *self.slot.lock().unwrap() = Some(outcome);
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct LevelTable {
    /// level -> digest; entries are never recomputed or invalidated.
    cache: HashMap<u32, Digest>,
    /// level -> in-flight computation other callers can attach to.
    flights: HashMap<u32, Arc<Flight>>,
}

enum Role {
    Cached(Digest),
    Waiter(Arc<Flight>),
    Owner(Arc<Flight>),
}

/// Per-file incremental digest cache over growing byte windows.
///
/// Cheap to create; no I/O happens until the first uncached
/// [`get`](Self::get) or [`get_sync`](Self::get_sync).
///
/// Concurrent requests for the same level are coalesced into a single
/// physical read sequence; every caller receives that computation's result.
pub struct ChunkHasher {
    path: PathBuf,
    size: u64,
    max_level: u32,
    read_buffer: usize,
    diag: Arc<Diagnostics>,
    levels: Mutex<LevelTable>,
    file: Mutex<Option<File>>,
    last_bytes: AtomicU64,
}

impl std::fmt::Debug for ChunkHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHasher")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("max_level", &self.max_level)
            .finish_non_exhaustive()
    }
}

impl ChunkHasher {
    /// Create a hasher for `path`, whose size the caller already knows.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, size: u64, diag: Arc<Diagnostics>) -> Self {
        Self {
            path: path.into(),
            size,
            max_level: max_level(size),
            read_buffer: DEFAULT_READ_BUFFER,
            diag,
            levels: Mutex::new(LevelTable::default()),
            file: Mutex::new(None),
            last_bytes: AtomicU64::new(0),
        }
    }

    /// Set the read buffer size (clamped to at least 512 bytes).
    #[must_use]
    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = bytes.max(512);
        self
    }

    /// The file this hasher reads.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Highest level of this file's window schedule.
    #[must_use]
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Bytes consumed by the most recent digest computation on this hasher.
    /// Zero after a cache hit, a coalesced wait, or a no-content result.
    #[must_use]
    pub fn last_bytes(&self) -> u64 {
        self.last_bytes.load(Ordering::Relaxed)
    }

    /// Digest of `level`, thread-safe variant.
    ///
    /// Returns `None` for zero-length files (the distinguished no-content
    /// marker). Cached levels return immediately with zero bytes read. If
    /// another thread is already computing this level, the caller parks on
    /// the shared in-flight slot and receives that computation's result,
    /// success or error; at most one physical read sequence happens per
    /// level regardless of concurrent callers.
    ///
    /// # Errors
    ///
    /// Open/read failures abort only this level's computation, are delivered
    /// to every parked waiter, and write no cache entry; other levels are
    /// unaffected and a later call may recompute.
    pub fn get(&self, level: u32) -> Result<Option<Digest>> {
        if self.size == 0 {
            self.last_bytes.store(0, Ordering::Relaxed);
            return Ok(None);
        }

        let role = {
            let mut table = self.levels.lock().unwrap();
            if let Some(digest) = table.cache.get(&level) {
                Role::Cached(*digest)
            } else if let Some(flight) = table.flights.get(&level) {
                Role::Waiter(Arc::clone(flight))
            } else {
                let flight = Arc::new(Flight::default());
                table.flights.insert(level, Arc::clone(&flight));
                Role::Owner(flight)
            }
        };

        match role {
            Role::Cached(digest) => {
                self.last_bytes.store(0, Ordering::Relaxed);
                Ok(Some(digest))
            }
            Role::Waiter(flight) => {
                self.last_bytes.store(0, Ordering::Relaxed);
                match flight.wait() {
                    Ok(digest) => Ok(Some(digest)),
                    Err((kind, msg)) => Err(Error::io(&self.path, io::Error::new(kind, msg))),
                }
            }
            Role::Owner(flight) => {
                let outcome = self.compute(level);
                let mut table = self.levels.lock().unwrap();
                table.flights.remove(&level);
                match outcome {
                    Ok((digest, bytes)) => {
                        table.cache.insert(level, digest);
                        drop(table);
                        self.last_bytes.store(bytes, Ordering::Relaxed);
                        self.diag.add_bytes_read(bytes);
                        flight.complete(Ok(digest));
                        Ok(Some(digest))
                    }
                    Err(err) => {
                        drop(table);
                        flight.complete(Err((err.kind(), err.to_string())));
                        Err(Error::io(&self.path, err))
                    }
                }
            }
        }
    }

    /// Digest of `level`, exclusive-access variant.
    ///
    /// Same contract as [`get`](Self::get) without the single-flight
    /// machinery; used by the serial scheduling mode where no two
    /// operations interleave.
    ///
    /// # Errors
    ///
    /// Open/read failures surface as [`Error::Io`] and write no cache entry.
    pub fn get_sync(&self, level: u32) -> Result<Option<Digest>> {
        if self.size == 0 {
            self.last_bytes.store(0, Ordering::Relaxed);
            return Ok(None);
        }
        if let Some(digest) = self.levels.lock().unwrap().cache.get(&level) {
            self.last_bytes.store(0, Ordering::Relaxed);
            return Ok(Some(*digest));
        }

        let (digest, bytes) = self
            .compute(level)
            .map_err(|err| Error::io(&self.path, err))?;
        self.levels.lock().unwrap().cache.insert(level, digest);
        self.last_bytes.store(bytes, Ordering::Relaxed);
        self.diag.add_bytes_read(bytes);
        Ok(Some(digest))
    }

    /// Close the underlying file handle if open. Idempotent; the handle
    /// reopens lazily on the next uncached request.
    pub fn close(&self) {
        if self.file.lock().unwrap().take().is_some() {
            trace!("closed {}", self.path.display());
        }
    }

    /// Read the level's window in bounded chunks and digest it in file
    /// order. Returns the digest and the bytes actually read.
    fn compute(&self, level: u32) -> io::Result<(Digest, u64)> {
        let (offset, limit) = window(self.size, level);
        let total = limit - offset;
        if total == 0 {
            // Clamped-empty final window of a power-of-two size.
            return Ok((*blake3::Hasher::new().finalize().as_bytes(), 0));
        }

        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            trace!("opening {}", self.path.display());
            *guard = Some(File::open(&self.path)?);
        }
        let file = guard.as_mut().expect("file handle opened above");

        file.seek(SeekFrom::Start(offset))?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; total.min(self.read_buffer as u64) as usize];
        let mut read_total = 0u64;
        while read_total < total {
            let want = buf.len().min((total - read_total) as usize);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                // File shorter than its stat said; digest what exists.
                break;
            }
            hasher.update(&buf[..n]);
            read_total += n as u64;
        }
        trace!(
            "hashed {} level {} ({} bytes)",
            self.path.display(),
            level,
            read_total
        );
        Ok((*hasher.finalize().as_bytes(), read_total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn diag() -> Arc<Diagnostics> {
        Arc::new(Diagnostics::new())
    }

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[test]
    fn test_max_level_schedule() {
        assert_eq!(max_level(0), 0);
        assert_eq!(max_level(1), 0);
        assert_eq!(max_level(3), 0);
        assert_eq!(max_level(2047), 0);
        // Power of two lands one level past the data; see module docs.
        assert_eq!(max_level(2048), 1);
        assert_eq!(max_level(2049), 1);
        assert_eq!(max_level(4095), 1);
        assert_eq!(max_level(4096), 2);
        assert_eq!(max_level(5000), 2);
        assert_eq!(max_level(1 << 20), 10);
    }

    #[test]
    fn test_window_bounds() {
        assert_eq!(window(10_000, 0), (0, 2048));
        assert_eq!(window(10_000, 1), (2048, 4096));
        assert_eq!(window(10_000, 2), (4096, 8192));
        assert_eq!(window(10_000, 3), (8192, 10_000));
        // Clamped to size.
        assert_eq!(window(1000, 0), (0, 1000));
        assert_eq!(window(3000, 1), (2048, 3000));
        // Exact power of two: final window is empty.
        assert_eq!(window(4096, 2), (4096, 4096));
    }

    #[test]
    fn test_windows_partition_file() {
        for size in [1u64, 100, 2047, 2048, 2049, 4096, 5000, 100_000] {
            let mut covered = 0u64;
            for level in 0..=max_level(size) {
                let (offset, limit) = window(size, level);
                assert_eq!(offset, covered, "size {size} level {level}");
                covered = limit;
            }
            assert_eq!(covered, size, "size {size}");
        }
    }

    #[test]
    fn test_empty_file_has_no_content() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "empty", b"");
        let hasher = ChunkHasher::new(&path, 0, diag());
        assert_eq!(hasher.get_sync(0).unwrap(), None);
        assert_eq!(hasher.get(0).unwrap(), None);
        assert_eq!(hasher.last_bytes(), 0);
    }

    #[test]
    fn test_digest_cached_after_first_read() {
        let dir = TempDir::new().unwrap();
        let content = vec![7u8; 3000];
        let path = write_file(&dir, "f", &content);
        let diag = diag();
        let hasher = ChunkHasher::new(&path, 3000, Arc::clone(&diag));

        let first = hasher.get_sync(0).unwrap().unwrap();
        assert_eq!(hasher.last_bytes(), 2048);
        assert_eq!(diag.bytes_read(), 2048);

        let second = hasher.get_sync(0).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(hasher.last_bytes(), 0);
        assert_eq!(diag.bytes_read(), 2048);
    }

    #[test]
    fn test_levels_are_independent() {
        let dir = TempDir::new().unwrap();
        let mut content = vec![1u8; 5000];
        content[4000] = 9;
        let path = write_file(&dir, "f", &content);
        let hasher = ChunkHasher::new(&path, 5000, diag());

        let l2 = hasher.get_sync(2).unwrap().unwrap();
        assert_eq!(hasher.last_bytes(), 5000 - 4096);
        let l0 = hasher.get_sync(0).unwrap().unwrap();
        assert_ne!(l0, l2);
    }

    #[test]
    fn test_identical_windows_same_digest() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "a", &vec![3u8; 4000]);
        let b = write_file(&dir, "b", &vec![3u8; 4000]);
        let ha = ChunkHasher::new(&a, 4000, diag());
        let hb = ChunkHasher::new(&b, 4000, diag());
        for level in 0..=ha.max_level() {
            assert_eq!(ha.get_sync(level).unwrap(), hb.get_sync(level).unwrap());
        }
    }

    #[test]
    fn test_power_of_two_final_window_reads_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f", &vec![5u8; 4096]);
        let diag = diag();
        let hasher = ChunkHasher::new(&path, 4096, Arc::clone(&diag));

        assert_eq!(hasher.max_level(), 2);
        let digest = hasher.get_sync(2).unwrap().unwrap();
        assert_eq!(hasher.last_bytes(), 0);
        assert_eq!(diag.bytes_read(), 0);
        // Equal to any other empty window digest.
        assert_eq!(digest, *blake3::Hasher::new().finalize().as_bytes());
    }

    #[test]
    fn test_error_writes_no_cache_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing");
        let hasher = ChunkHasher::new(&path, 3000, diag());

        let err = hasher.get_sync(0).unwrap_err();
        assert_eq!(err.io_kind(), std::io::ErrorKind::NotFound);

        // Create the file; the level recomputes instead of serving a
        // poisoned entry.
        write_file(&dir, "missing", &vec![1u8; 3000]);
        assert!(hasher.get_sync(0).unwrap().is_some());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f", &vec![2u8; 100]);
        let hasher = ChunkHasher::new(&path, 100, diag());

        hasher.close(); // no prior open
        let d1 = hasher.get_sync(0).unwrap();
        hasher.close();
        hasher.close();
        // Cached digest survives the close; handle reopens only when needed.
        assert_eq!(hasher.get(0).unwrap(), d1);
    }

    #[test]
    fn test_single_flight_coalesces_reads() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f", &vec![8u8; 100_000]);
        let diag = diag();
        let hasher = Arc::new(ChunkHasher::new(&path, 100_000, Arc::clone(&diag)));

        let digests: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let hasher = Arc::clone(&hasher);
                    s.spawn(move || hasher.get(0).unwrap().unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        // One physical read sequence regardless of caller count.
        assert_eq!(diag.bytes_read(), 2048);
    }

    #[test]
    fn test_small_read_buffer_same_digest() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let path = write_file(&dir, "f", &content);

        let whole = ChunkHasher::new(&path, 3000, diag());
        let chunked = ChunkHasher::new(&path, 3000, diag()).with_read_buffer(512);
        for level in 0..=whole.max_level() {
            assert_eq!(
                whole.get_sync(level).unwrap(),
                chunked.get_sync(level).unwrap()
            );
        }
    }
}
