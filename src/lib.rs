//! dupindex - incremental duplicate-file index.
//!
//! Detects duplicate files by content without hashing whole files when a
//! cheap partial comparison can prove inequality. An external traversal
//! feeds paths to a [`DuplicateIndex`]; files are bucketed by size, proven
//! duplicates of the same inode are short-circuited, and ambiguous files
//! are compared through level-indexed [`ChunkHasher`]s that digest
//! geometrically growing byte windows on demand. After all files are
//! admitted, [`Canonicalizer`] re-derives order-independent equivalence
//! clusters and elects a canonical path per cluster.

pub mod canonical;
pub mod config;
pub mod diag;
pub mod error;
pub mod hasher;
pub mod index;
pub mod path_utils;

pub use canonical::{CanonicalStats, Canonicalizer};
pub use config::{IndexConfig, Scheduling};
pub use diag::{Diagnostics, DiagnosticsSnapshot};
pub use error::{Error, Result};
pub use hasher::{ChunkHasher, Digest};
pub use index::{DuplicateIndex, FileStat, FindOutcome};
