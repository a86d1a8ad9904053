//! Order-independent canonicalization.
//!
//! # Overview
//!
//! Incremental [`find`](crate::index::DuplicateIndex::find) results depend
//! on arrival order: the reported target is whichever equal occupant was
//! admitted first, and equality is not transitively closed across separate
//! comparisons. [`Canonicalizer`] corrects this in one exhaustive batch
//! pass after all files are admitted: every unordered pair within a size
//! bucket is compared exactly once, equal pairs are merged into disjoint
//! clusters, and each multi-member cluster elects the member whose path
//! name sorts first as its canonical representative.
//!
//! The pass reuses the index's retained chunk hashers, so digests cached
//! during incremental admission are not recomputed. It is quadratic in each
//! bucket's cardinality, which is acceptable because size buckets are small
//! relative to the corpus.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{debug, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::Scheduling;
use crate::error::Result;
use crate::index::DuplicateIndex;

/// Statistics from one canonicalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CanonicalStats {
    /// Sizes with at least two known files.
    pub sizes_examined: usize,
    /// Unordered pairs compared.
    pub pairs_compared: usize,
    /// Multi-member clusters found.
    pub clusters: usize,
    /// Files belonging to a multi-member cluster.
    pub clustered_files: usize,
    /// Files excluded from clustering because their I/O failed.
    pub failed_files: usize,
}

/// Post-hoc exhaustive pairwise comparison over an index's size buckets.
pub struct Canonicalizer<'a> {
    index: &'a DuplicateIndex,
}

impl<'a> Canonicalizer<'a> {
    /// Create a canonicalizer over `index`.
    #[must_use]
    pub fn new(index: &'a DuplicateIndex) -> Self {
        Self { index }
    }

    /// Compute the path-to-canonical mapping.
    ///
    /// Every member of a multi-member cluster maps to the cluster's
    /// canonical path (the canonical member maps to itself); singletons are
    /// omitted. Cluster members share a size by construction, so the
    /// canonical choice orders by path name only, compared byte-wise
    /// (`OsStr` order) rather than with locale-aware collation, so the
    /// elected member is stable across environments.
    ///
    /// A pair whose comparison fails with I/O excludes the offending file
    /// from further clustering in this pass (logged); other files and sizes
    /// are unaffected. In practice this guards against files removed or
    /// made unreadable after admission: digests cached during admission
    /// resolve almost every pair without touching the filesystem again.
    #[must_use]
    pub fn canonicalize(&self) -> (BTreeMap<PathBuf, PathBuf>, CanonicalStats) {
        let mut mapping = BTreeMap::new();
        let mut stats = CanonicalStats::default();

        for (size, members) in self.index.buckets_snapshot() {
            if members.len() < 2 {
                continue;
            }
            stats.sizes_examined += 1;
            for cluster in self.cluster_bucket(size, &members, &mut stats) {
                if cluster.len() < 2 {
                    continue;
                }
                stats.clusters += 1;
                stats.clustered_files += cluster.len();
                let canonical = cluster
                    .iter()
                    .map(|&i| members[i].clone())
                    .min_by(|a, b| a.as_os_str().cmp(b.as_os_str()))
                    .expect("cluster has members");
                for &i in &cluster {
                    mapping.insert(members[i].clone(), canonical.clone());
                }
            }
        }

        debug!(
            "canonicalized {} clusters over {} sizes ({} pairs)",
            stats.clusters, stats.sizes_examined, stats.pairs_compared
        );
        (mapping, stats)
    }

    /// Compare every unordered pair of one bucket and group the members
    /// into disjoint clusters of proven-equal files.
    fn cluster_bucket(
        &self,
        size: u64,
        members: &[PathBuf],
        stats: &mut CanonicalStats,
    ) -> Vec<Vec<usize>> {
        let mut pairs = Vec::with_capacity(members.len() * (members.len() - 1) / 2);
        for i in 0..members.len() {
            for j in i + 1..members.len() {
                pairs.push((i, j));
            }
        }
        stats.pairs_compared += pairs.len();

        let compare = |&(i, j): &(usize, usize)| -> ((usize, usize), Result<bool>) {
            ((i, j), self.index.compare_paths(&members[i], &members[j], size))
        };
        let results: Vec<((usize, usize), Result<bool>)> = match self.index.scheduling() {
            Scheduling::Serial => pairs.iter().map(compare).collect(),
            Scheduling::Concurrent => pairs.par_iter().map(compare).collect(),
        };

        let mut excluded = vec![false; members.len()];
        let mut set = ClusterSet::new(members.len());
        for ((i, j), result) in results {
            if excluded[i] || excluded[j] {
                continue;
            }
            match result {
                Ok(true) => set.union(i, j),
                Ok(false) => {}
                Err(err) => {
                    warn!("canonicalize: excluding {}: {err}", err.path().display());
                    stats.failed_files += 1;
                    let offender = members.iter().position(|m| m.as_path() == err.path());
                    match offender {
                        Some(idx) => excluded[idx] = true,
                        // Unattributable failure; drop both sides.
                        None => {
                            excluded[i] = true;
                            excluded[j] = true;
                        }
                    }
                }
            }
        }

        set.clusters()
    }
}

/// Union-find over bucket-member indices. Merging keeps the lowest original
/// index as the cluster root.
struct ClusterSet {
    parent: Vec<usize>,
}

impl ClusterSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }

    /// Disjoint clusters, each sorted by member index, ordered by root.
    fn clusters(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..self.parent.len() {
            by_root.entry(self.find(i)).or_default().push(i);
        }
        by_root.into_values().collect()
    }
}
