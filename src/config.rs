//! Index configuration.
//!
//! [`IndexConfig`] selects the scheduling discipline and tunes the fan-out
//! and read-buffer knobs. The default is fully serial processing, which is
//! deterministic and has a minimal resource footprint.

/// Scheduling discipline for index operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scheduling {
    /// All I/O blocks the calling thread; admissions and level reads execute
    /// strictly in call order with no interleaving.
    #[default]
    Serial,
    /// Callers may admit files from many threads. Same-size admissions are
    /// still serialized in call order; comparisons within one admission and
    /// both sides of a level fetch run on scoped worker threads.
    Concurrent,
}

/// Configuration for a [`DuplicateIndex`](crate::index::DuplicateIndex).
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Scheduling discipline.
    pub scheduling: Scheduling,
    /// Maximum number of existing bucket occupants compared against
    /// concurrently during one admission (concurrent mode only).
    pub fanout: usize,
    /// Read buffer size for chunked window reads, in bytes.
    pub read_buffer: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            scheduling: Scheduling::Serial,
            fanout: 8,
            read_buffer: 64 * 1024,
        }
    }
}

impl IndexConfig {
    /// Set the scheduling discipline.
    #[must_use]
    pub fn with_scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// Set the admission fan-out bound (clamped to at least 1).
    #[must_use]
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    /// Set the read buffer size (clamped to at least 512 bytes).
    #[must_use]
    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = bytes.max(512);
        self
    }
}
