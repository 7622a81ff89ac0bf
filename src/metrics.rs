//! Worker metrics handle: explicit counters constructed by the embedding
//! runner and passed into the superstep controller, in place of any
//! process-wide registry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters describing one worker's activity.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    /// Supersteps this worker completed (input superstep included).
    pub supersteps: AtomicU64,

    /// Messages produced by user programs on this worker.
    pub messages_sent: AtomicU64,

    /// Vertices computed across all supersteps.
    pub vertices_computed: AtomicU64,

    /// Checkpoints successfully written.
    pub checkpoints_written: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_supersteps(&self, n: u64) {
        self.supersteps.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_messages_sent(&self, n: u64) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_vertices_computed(&self, n: u64) {
        self.vertices_computed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_checkpoints_written(&self, n: u64) {
        self.checkpoints_written.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time snapshot, for logging at job end.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            supersteps: self.supersteps.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            vertices_computed: self.vertices_computed.load(Ordering::Relaxed),
            checkpoints_written: self
                .checkpoints_written
                .load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub supersteps: u64,
    pub messages_sent: u64,
    pub vertices_computed: u64,
    pub checkpoints_written: u64,
}
