//! Read-only diagnostic counters.
//!
//! The index keeps cumulative totals of bytes read by chunk hashing and of
//! stat calls it performed on behalf of callers. Counters are advisory
//! telemetry only; they never influence control flow.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cumulative diagnostic counters, shared by an index, its chunk hashers
/// and the canonicalization pass.
#[derive(Debug, Default)]
pub struct Diagnostics {
    bytes_read: AtomicU64,
    stat_calls: AtomicU64,
}

impl Diagnostics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_stat_call(&self) {
        self.stat_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Total bytes read by chunk hashing so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Number of stat calls the index performed itself (calls that supplied
    /// their own stat record are not counted).
    #[must_use]
    pub fn stat_calls(&self) -> u64 {
        self.stat_calls.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            bytes_read: self.bytes_read(),
            stat_calls: self.stat_calls(),
        }
    }
}

/// Serializable snapshot of [`Diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Total bytes read by chunk hashing.
    pub bytes_read: u64,
    /// Stat calls performed by the index.
    pub stat_calls: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let diag = Diagnostics::new();
        assert_eq!(diag.bytes_read(), 0);
        assert_eq!(diag.stat_calls(), 0);

        diag.add_bytes_read(2048);
        diag.add_bytes_read(100);
        diag.add_stat_call();

        assert_eq!(diag.bytes_read(), 2148);
        assert_eq!(diag.stat_calls(), 1);
    }

    #[test]
    fn test_snapshot_is_plain_data() {
        let diag = Diagnostics::new();
        diag.add_bytes_read(7);
        let snap = diag.snapshot();
        assert_eq!(
            snap,
            DiagnosticsSnapshot {
                bytes_read: 7,
                stat_calls: 0
            }
        );

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"bytes_read\":7"));
    }
}
