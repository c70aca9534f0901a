//! Write path counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one key write
///
/// Updated with relaxed atomics; shared between the writer, its sessions
/// and its allocation client.
#[derive(Debug, Default)]
pub struct WriteStats {
    bytes_accepted: AtomicU64,
    blocks_allocated: AtomicU64,
    chunks_written: AtomicU64,
    flushes: AtomicU64,
    in_place_retries: AtomicU64,
    replacements: AtomicU64,
    bytes_replayed: AtomicU64,
    excluded_containers: AtomicU64,
    excluded_pipelines: AtomicU64,
    excluded_nodes: AtomicU64,
}

/// Point-in-time copy of `WriteStats`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WriteStatsSnapshot {
    pub bytes_accepted: u64,
    pub blocks_allocated: u64,
    pub chunks_written: u64,
    pub flushes: u64,
    pub in_place_retries: u64,
    pub replacements: u64,
    pub bytes_replayed: u64,
    pub excluded_containers: u64,
    pub excluded_pipelines: u64,
    pub excluded_nodes: u64,
}

impl WriteStats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self, bytes: u64) {
        self.bytes_accepted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_allocation(&self) {
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_place_retry(&self) {
        self.in_place_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a replacement block carrying `replayed` bytes from a failed one
    pub fn record_replacement(&self, replayed: u64) {
        self.replacements.fetch_add(1, Ordering::Relaxed);
        self.bytes_replayed.fetch_add(replayed, Ordering::Relaxed);
    }

    /// Record newly added exclusions
    pub fn record_exclusions(&self, containers: u64, pipelines: u64, nodes: u64) {
        self.excluded_containers
            .fetch_add(containers, Ordering::Relaxed);
        self.excluded_pipelines
            .fetch_add(pipelines, Ordering::Relaxed);
        self.excluded_nodes.fetch_add(nodes, Ordering::Relaxed);
    }

    /// Get total replacement blocks used
    pub fn replacements(&self) -> u64 {
        self.replacements.load(Ordering::Relaxed)
    }

    /// Copy every counter
    #[must_use]
    pub fn snapshot(&self) -> WriteStatsSnapshot {
        WriteStatsSnapshot {
            bytes_accepted: self.bytes_accepted.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            in_place_retries: self.in_place_retries.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            bytes_replayed: self.bytes_replayed.load(Ordering::Relaxed),
            excluded_containers: self.excluded_containers.load(Ordering::Relaxed),
            excluded_pipelines: self.excluded_pipelines.load(Ordering::Relaxed),
            excluded_nodes: self.excluded_nodes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = WriteStats::new();
        stats.record_accepted(100);
        stats.record_accepted(50);
        stats.record_replacement(30);
        stats.record_exclusions(1, 0, 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_accepted, 150);
        assert_eq!(snapshot.replacements, 1);
        assert_eq!(snapshot.bytes_replayed, 30);
        assert_eq!(snapshot.excluded_containers, 1);
        assert_eq!(snapshot.excluded_nodes, 2);
        assert_eq!(stats.replacements(), 1);
    }
}
