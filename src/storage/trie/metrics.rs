//! Trie metrics
//!
//! Counters for the expensive trie operations. The trie only talks to the
//! [`TrieMetrics`] trait, so callers can plug in their own sink.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for trie operation counts
pub trait TrieMetrics: Send + Sync {
    /// A node digest was computed
    fn hash_calculated(&self);

    /// A node was loaded from the backing store
    fn node_read(&self);

    /// A node was written to the backing store
    fn node_written(&self);
}

/// Metrics sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl TrieMetrics for NoopMetrics {
    fn hash_calculated(&self) {}
    fn node_read(&self) {}
    fn node_written(&self) {}
}

/// Snapshot of [`TrieCounters`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrieStats {
    /// Number of node digests computed
    pub hashes_calculated: u64,

    /// Number of nodes loaded from the store
    pub nodes_read: u64,

    /// Number of nodes written to the store
    pub nodes_written: u64,
}

/// Atomic counters implementing [`TrieMetrics`]
#[derive(Debug, Default)]
pub struct TrieCounters {
    hashes_calculated: AtomicU64,
    nodes_read: AtomicU64,
    nodes_written: AtomicU64,
}

impl TrieCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values
    pub fn stats(&self) -> TrieStats {
        TrieStats {
            hashes_calculated: self.hashes_calculated.load(Ordering::Relaxed),
            nodes_read: self.nodes_read.load(Ordering::Relaxed),
            nodes_written: self.nodes_written.load(Ordering::Relaxed),
        }
    }
}

impl TrieMetrics for TrieCounters {
    fn hash_calculated(&self) {
        self.hashes_calculated.fetch_add(1, Ordering::Relaxed);
    }

    fn node_read(&self) {
        self.nodes_read.fetch_add(1, Ordering::Relaxed);
    }

    fn node_written(&self) {
        self.nodes_written.fetch_add(1, Ordering::Relaxed);
    }
}
