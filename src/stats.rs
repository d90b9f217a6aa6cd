//! Per-container counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct JournalStats {
    fast_path_writes: AtomicU64,
    slow_path_writes: AtomicU64,
    rotations: AtomicU64,
    objects_reclaimed: AtomicU64,
    syncs_issued: AtomicU64,
    syncs_saved: AtomicU64,
    direct_commits: AtomicU64,
}

/// Point-in-time copy of `JournalStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub fast_path_writes: u64,
    pub slow_path_writes: u64,
    pub rotations: u64,
    pub objects_reclaimed: u64,
    pub syncs_issued: u64,
    pub syncs_saved: u64,
    pub direct_commits: u64,
}

impl JournalStats {
    pub fn record_fast_path(&self) {
        self.fast_path_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_path(&self) {
        self.slow_path_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self) {
        self.objects_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_issued(&self) {
        self.syncs_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_saved(&self) {
        self.syncs_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_direct_commit(&self) {
        self.direct_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fast_path_writes: self.fast_path_writes.load(Ordering::Relaxed),
            slow_path_writes: self.slow_path_writes.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            objects_reclaimed: self.objects_reclaimed.load(Ordering::Relaxed),
            syncs_issued: self.syncs_issued.load(Ordering::Relaxed),
            syncs_saved: self.syncs_saved.load(Ordering::Relaxed),
            direct_commits: self.direct_commits.load(Ordering::Relaxed),
        }
    }
}
