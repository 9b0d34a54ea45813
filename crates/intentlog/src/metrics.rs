//! Per-engine counters.
//!
//! Deliberately not process-global: every [`crate::IntentLog`] owns its
//! own set, reachable through [`crate::IntentLog::metrics`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub commit_count: AtomicU64,
    pub commit_writer_count: AtomicU64,
    pub commit_error_count: AtomicU64,
    pub commit_stall_count: AtomicU64,
    pub commit_suspend_count: AtomicU64,
    pub itx_count: AtomicU64,
    pub itx_copied_count: AtomicU64,
    pub itx_copied_bytes: AtomicU64,
    pub itx_needcopy_count: AtomicU64,
    pub itx_needcopy_bytes: AtomicU64,
    pub itx_indirect_count: AtomicU64,
    pub itx_indirect_bytes: AtomicU64,
    pub blocks_allocated_slog: AtomicU64,
    pub blocks_allocated_normal: AtomicU64,
    pub bytes_written_slog: AtomicU64,
    pub bytes_written_normal: AtomicU64,
}

impl Metrics {
    pub(crate) fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            commit_count: get(&self.commit_count),
            commit_writer_count: get(&self.commit_writer_count),
            commit_error_count: get(&self.commit_error_count),
            commit_stall_count: get(&self.commit_stall_count),
            commit_suspend_count: get(&self.commit_suspend_count),
            itx_count: get(&self.itx_count),
            itx_copied_count: get(&self.itx_copied_count),
            itx_copied_bytes: get(&self.itx_copied_bytes),
            itx_needcopy_count: get(&self.itx_needcopy_count),
            itx_needcopy_bytes: get(&self.itx_needcopy_bytes),
            itx_indirect_count: get(&self.itx_indirect_count),
            itx_indirect_bytes: get(&self.itx_indirect_bytes),
            blocks_allocated_slog: get(&self.blocks_allocated_slog),
            blocks_allocated_normal: get(&self.blocks_allocated_normal),
            bytes_written_slog: get(&self.bytes_written_slog),
            bytes_written_normal: get(&self.bytes_written_normal),
        }
    }
}

/// Point-in-time copy of an engine's counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub commit_count: u64,
    pub commit_writer_count: u64,
    pub commit_error_count: u64,
    pub commit_stall_count: u64,
    pub commit_suspend_count: u64,
    pub itx_count: u64,
    pub itx_copied_count: u64,
    pub itx_copied_bytes: u64,
    pub itx_needcopy_count: u64,
    pub itx_needcopy_bytes: u64,
    pub itx_indirect_count: u64,
    pub itx_indirect_bytes: u64,
    pub blocks_allocated_slog: u64,
    pub blocks_allocated_normal: u64,
    pub bytes_written_slog: u64,
    pub bytes_written_normal: u64,
}
