//! The duplicate index.
//!
//! # Overview
//!
//! [`DuplicateIndex`] owns the inode and size tables and admits files one by
//! one via [`find`](DuplicateIndex::find). Admission consults the inode
//! table first (hardlinks are duplicates with zero bytes read), then the
//! size bucket for the file's length, and only when the bucket is ambiguous
//! does it compare content through [`ChunkHasher`]s, level by level.
//!
//! Admissions for one size value are serialized in call order by a per-size
//! FIFO gate, so repeated runs with identical call order produce identical
//! bucket membership regardless of I/O completion timing. Distinct sizes
//! proceed independently; no lock spans more than one size value.
//!
//! Incremental results are order-dependent (the reported target depends on
//! arrival order); [`canonicalize`](DuplicateIndex::canonicalize) re-derives
//! order-independent clusters once all files are admitted.

use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::canonical::Canonicalizer;
use crate::config::{IndexConfig, Scheduling};
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::hasher::ChunkHasher;
use crate::path_utils::normalize_path;

/// The stat fields the index cares about. Supplied by the caller or derived
/// from [`std::fs::metadata`].
///
/// An `ino` of zero means "no inode information"; such files skip the
/// hardlink short-circuit and are always compared by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// File length in bytes.
    pub size: u64,
    /// Device identifier.
    pub dev: u64,
    /// Inode number (0 when unavailable).
    pub ino: u64,
    /// Whether this is a regular file.
    pub is_file: bool,
}

impl FileStat {
    /// Derive a stat record from filesystem metadata.
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        #[cfg(unix)]
        let (dev, ino) = {
            use std::os::unix::fs::MetadataExt;
            (meta.dev(), meta.ino())
        };
        #[cfg(not(unix))]
        let (dev, ino) = (0, 0);

        Self {
            size: meta.len(),
            dev,
            ino,
            is_file: meta.is_file(),
        }
    }
}

/// Result of one admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FindOutcome {
    /// First-admitted path with identical content, if any.
    pub duplicate_of: Option<PathBuf>,
    /// The stat record the decision was based on.
    pub stat: FileStat,
}

impl FindOutcome {
    /// Whether no duplicate was found for this admission.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.duplicate_of.is_none()
    }
}

/// Ordered list of paths sharing one size. Append-only; insertion order is
/// first-admission order and no path appears twice.
#[derive(Debug, Default)]
struct SizeBucket {
    paths: Vec<PathBuf>,
}

/// FIFO ticket gate serializing admissions for one size value.
#[derive(Debug, Default)]
struct SizeGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    next_ticket: u64,
    now_serving: u64,
}

impl SizeGate {
    /// Take the next ticket and block until it is served. Tickets are
    /// served strictly in the order they were taken.
    fn enter(self: &Arc<Self>) -> GatePass {
        let mut state = self.state.lock().unwrap();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.now_serving != ticket {
            state = self.cond.wait(state).unwrap();
        }
        drop(state);
        GatePass {
            gate: Arc::clone(self),
        }
    }
}

struct GatePass {
    gate: Arc<SizeGate>,
}

impl Drop for GatePass {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.now_serving += 1;
        self.gate.cond.notify_all();
    }
}

/// Content-based duplicate detector fed by an external traversal.
///
/// # Example
///
/// ```no_run
/// use dupindex::{DuplicateIndex, IndexConfig};
///
/// let index = DuplicateIndex::new(IndexConfig::default());
/// for path in ["a.bin", "b.bin", "c.bin"] {
///     let outcome = index.find(path)?;
///     match outcome.duplicate_of {
///         Some(first) => println!("{path} duplicates {}", first.display()),
///         None => println!("{path} is unique so far"),
///     }
/// }
/// let _canonical = index.canonicalize();
/// # Ok::<(), dupindex::Error>(())
/// ```
pub struct DuplicateIndex {
    config: IndexConfig,
    diag: Arc<Diagnostics>,
    inodes: Mutex<HashMap<(u64, u64), PathBuf>>,
    buckets: Mutex<HashMap<u64, SizeBucket>>,
    gates: Mutex<HashMap<u64, Arc<SizeGate>>>,
    hashers: Mutex<HashMap<PathBuf, Arc<ChunkHasher>>>,
}

impl std::fmt::Debug for DuplicateIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateIndex")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DuplicateIndex {
    /// Create an index with the given configuration.
    #[must_use]
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            diag: Arc::new(Diagnostics::new()),
            inodes: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            hashers: Mutex::new(HashMap::new()),
        }
    }

    /// Create an index with the default (serial) configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(IndexConfig::default())
    }

    /// The configuration this index runs with.
    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Cumulative diagnostic counters (bytes read, stat calls).
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    /// Admit a file, statting it first.
    ///
    /// Non-regular and zero-length files resolve to "no duplicate" without
    /// further processing.
    ///
    /// # Errors
    ///
    /// Stat failures, and open/read failures during content comparison,
    /// surface as [`Error::Io`]. A failed admission leaves the file out of
    /// its size bucket; other files and sizes are unaffected.
    pub fn find(&self, path: impl AsRef<Path>) -> Result<FindOutcome> {
        let path = normalize_path(path.as_ref());
        self.diag.add_stat_call();
        let meta = fs::metadata(&path).map_err(|err| Error::io(&path, err))?;
        let stat = FileStat::from_metadata(&meta);
        self.admit(path, stat)
    }

    /// Admit a file whose stat record the caller already holds (no stat
    /// call is performed or counted).
    ///
    /// # Errors
    ///
    /// Open/read failures during content comparison surface as
    /// [`Error::Io`].
    pub fn find_with_stat(&self, path: impl AsRef<Path>, stat: FileStat) -> Result<FindOutcome> {
        self.admit(normalize_path(path.as_ref()), stat)
    }

    /// Snapshot of the size bucket for `size`, in admission order.
    #[must_use]
    pub fn bucket(&self, size: u64) -> Vec<PathBuf> {
        self.buckets
            .lock()
            .unwrap()
            .get(&size)
            .map(|bucket| bucket.paths.clone())
            .unwrap_or_default()
    }

    /// Re-derive order-independent equivalence clusters over every admitted
    /// file and return a mapping from each clustered path to its cluster's
    /// canonical path. See [`Canonicalizer`].
    #[must_use]
    pub fn canonicalize(&self) -> std::collections::BTreeMap<PathBuf, PathBuf> {
        Canonicalizer::new(self).canonicalize().0
    }

    fn admit(&self, path: PathBuf, stat: FileStat) -> Result<FindOutcome> {
        if !stat.is_file || stat.size == 0 {
            debug!(
                "{}: not a regular non-empty file, no duplicate",
                path.display()
            );
            return Ok(FindOutcome {
                duplicate_of: None,
                stat,
            });
        }

        // Hardlink short-circuit: same device and inode means identical
        // content, no bucket interaction, no hashing.
        if stat.ino != 0 {
            let inodes = self.inodes.lock().unwrap();
            if let Some(first) = inodes.get(&(stat.dev, stat.ino)) {
                if *first != path {
                    debug!("{}: hardlink of {}", path.display(), first.display());
                    return Ok(FindOutcome {
                        duplicate_of: Some(first.clone()),
                        stat,
                    });
                }
            }
        }

        let gate = self.gate_for(stat.size);
        let _pass = gate.enter();

        // Membership is decided under the gate; comparisons run outside the
        // bucket lock. Re-admitting a known path is a membership no-op and
        // compares only against the occupants admitted before it.
        let (occupants, appended) = {
            let mut buckets = self.buckets.lock().unwrap();
            let bucket = buckets.entry(stat.size).or_default();
            match bucket.paths.iter().position(|p| *p == path) {
                Some(pos) => (bucket.paths[..pos].to_vec(), false),
                None => {
                    let occupants = bucket.paths.clone();
                    bucket.paths.push(path.clone());
                    (occupants, true)
                }
            }
        };

        if occupants.is_empty() {
            self.record_inode(&path, stat);
            debug!("{}: first of size {}", path.display(), stat.size);
            return Ok(FindOutcome {
                duplicate_of: None,
                stat,
            });
        }

        let duplicate_of = match self.compare_fanout(&path, &occupants, stat.size) {
            Ok(result) => result,
            Err(err) => {
                if appended {
                    let mut buckets = self.buckets.lock().unwrap();
                    if let Some(bucket) = buckets.get_mut(&stat.size) {
                        bucket.paths.retain(|p| *p != path);
                    }
                }
                return Err(err);
            }
        };

        self.record_inode(&path, stat);
        match &duplicate_of {
            Some(first) => debug!("{}: duplicate of {}", path.display(), first.display()),
            None => debug!("{}: unique among size {}", path.display(), stat.size),
        }
        Ok(FindOutcome { duplicate_of, stat })
    }

    fn gate_for(&self, size: u64) -> Arc<SizeGate> {
        Arc::clone(self.gates.lock().unwrap().entry(size).or_default())
    }

    fn record_inode(&self, path: &Path, stat: FileStat) {
        if stat.ino != 0 {
            self.inodes
                .lock()
                .unwrap()
                .entry((stat.dev, stat.ino))
                .or_insert_with(|| path.to_path_buf());
        }
    }

    /// Compare `path` against existing occupants, earliest first. The first
    /// occupant proven equal (in bucket order) determines the result. In
    /// concurrent mode occupants are compared in batches of up to the
    /// configured fan-out; comparisons already running when a match lands
    /// finish normally (their cached digests stay useful) and their
    /// outcomes are discarded.
    fn compare_fanout(
        &self,
        path: &Path,
        occupants: &[PathBuf],
        size: u64,
    ) -> Result<Option<PathBuf>> {
        match self.config.scheduling {
            Scheduling::Serial => {
                for occupant in occupants {
                    if self.compare_paths(occupant, path, size)? {
                        return Ok(Some(occupant.clone()));
                    }
                }
                Ok(None)
            }
            Scheduling::Concurrent => {
                for batch in occupants.chunks(self.config.fanout) {
                    let results: Vec<Result<bool>> = thread::scope(|scope| {
                        let handles: Vec<_> = batch
                            .iter()
                            .map(|occupant| {
                                scope.spawn(move || self.compare_paths(occupant, path, size))
                            })
                            .collect();
                        handles
                            .into_iter()
                            .map(|handle| handle.join().expect("comparison worker panicked"))
                            .collect()
                    });
                    for (occupant, result) in batch.iter().zip(results) {
                        if result? {
                            return Ok(Some(occupant.clone()));
                        }
                    }
                }
                Ok(None)
            }
        }
    }

    /// Incrementally compare two equal-size files, level by level. Both
    /// handles are closed once the comparison resolves; the hashers and
    /// their digest caches are retained for later comparisons.
    pub(crate) fn compare_paths(&self, a: &Path, b: &Path, size: u64) -> Result<bool> {
        let ha = self.hasher_for(a, size);
        let hb = self.hasher_for(b, size);
        let result = self.compare_hashers(&ha, &hb);
        ha.close();
        hb.close();
        result
    }

    fn compare_hashers(&self, a: &Arc<ChunkHasher>, b: &Arc<ChunkHasher>) -> Result<bool> {
        // Equal sizes share the window schedule, so one max level serves
        // both sides.
        for level in 0..=a.max_level() {
            let (da, db) = match self.config.scheduling {
                Scheduling::Serial => (a.get_sync(level)?, b.get_sync(level)?),
                Scheduling::Concurrent => {
                    let (ra, rb) = thread::scope(|scope| {
                        let side_b = Arc::clone(b);
                        let handle = scope.spawn(move || side_b.get(level));
                        let ra = a.get(level);
                        let rb = handle.join().expect("level fetch worker panicked");
                        (ra, rb)
                    });
                    (ra?, rb?)
                }
            };
            if da != db {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The retained hasher for `path`, created on first reference. Hashers
    /// are shared by every comparison that touches the same path, so window
    /// digests are computed at most once per run.
    pub(crate) fn hasher_for(&self, path: &Path, size: u64) -> Arc<ChunkHasher> {
        let mut hashers = self.hashers.lock().unwrap();
        if let Some(hasher) = hashers.get(path) {
            return Arc::clone(hasher);
        }
        let hasher = Arc::new(
            ChunkHasher::new(path, size, Arc::clone(&self.diag))
                .with_read_buffer(self.config.read_buffer),
        );
        hashers.insert(path.to_path_buf(), Arc::clone(&hasher));
        hasher
    }

    /// Sizes and bucket members known to the index, for the
    /// canonicalization pass.
    pub(crate) fn buckets_snapshot(&self) -> Vec<(u64, Vec<PathBuf>)> {
        let mut snapshot: Vec<(u64, Vec<PathBuf>)> = self
            .buckets
            .lock()
            .unwrap()
            .iter()
            .map(|(size, bucket)| (*size, bucket.paths.clone()))
            .collect();
        snapshot.sort_by_key(|(size, _)| *size);
        snapshot
    }

    pub(crate) fn scheduling(&self) -> Scheduling {
        self.config.scheduling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_file_stat_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        let stat = FileStat::from_metadata(&std::fs::metadata(&path).unwrap());
        assert_eq!(stat.size, 5);
        assert!(stat.is_file);
        #[cfg(unix)]
        assert_ne!(stat.ino, 0);

        let dir_stat = FileStat::from_metadata(&std::fs::metadata(dir.path()).unwrap());
        assert!(!dir_stat.is_file);
    }

    #[test]
    fn test_gate_serves_tickets_in_order() {
        let gate = Arc::new(SizeGate::default());
        let served = Arc::new(AtomicUsize::new(0));

        let first = gate.enter();
        let order: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let gate = Arc::clone(&gate);
                    let served = Arc::clone(&served);
                    let handle = scope.spawn(move || {
                        let _pass = gate.enter();
                        served.fetch_add(1, Ordering::SeqCst)
                    });
                    // Give each thread time to take its ticket before the
                    // next one starts.
                    thread::sleep(Duration::from_millis(30));
                    handle
                })
                .collect();

            // Nobody proceeds while the first pass is held.
            assert_eq!(served.load(Ordering::SeqCst), 0);
            drop(first);
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_hasher_is_retained_per_path() {
        let index = DuplicateIndex::with_defaults();
        let a = index.hasher_for(Path::new("/x/a"), 100);
        let again = index.hasher_for(Path::new("/x/a"), 100);
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn test_ghost_stat_seeds_bucket_without_io() {
        let index = DuplicateIndex::with_defaults();
        let stat = FileStat {
            size: 4000,
            dev: 1,
            ino: 42,
            is_file: true,
        };
        let outcome = index.find_with_stat("/nowhere/ghost", stat).unwrap();
        assert!(outcome.is_unique());
        assert_eq!(index.bucket(4000), vec![PathBuf::from("/nowhere/ghost")]);
        assert_eq!(index.diagnostics().bytes_read(), 0);
        assert_eq!(index.diagnostics().stat_calls(), 0);
    }

    #[test]
    fn test_failed_admission_leaves_bucket_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::write(&real, vec![1u8; 4000]).unwrap();

        let index = DuplicateIndex::with_defaults();
        let ghost_stat = FileStat {
            size: 4000,
            dev: 1,
            ino: 0,
            is_file: true,
        };
        index.find_with_stat("/nowhere/ghost", ghost_stat).unwrap();

        // Comparing against the ghost fails to open it; the admission
        // errors and the real file stays out of the bucket.
        let err = index.find(&real).unwrap_err();
        assert_eq!(err.io_kind(), std::io::ErrorKind::NotFound);
        assert_eq!(index.bucket(4000), vec![PathBuf::from("/nowhere/ghost")]);
    }
}
