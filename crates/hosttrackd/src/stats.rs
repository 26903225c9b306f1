//! Engine counters.
//!
//! Owned by the tracker and read through [`TrackerStats::snapshot`] rather
//! than registered into process-global state, so embedding applications can
//! export them however they like.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters over the engine's lifetime.
#[derive(Debug, Default)]
pub struct TrackerStats {
    pub devices_learned: AtomicU64,
    pub devices_changed: AtomicU64,
    pub devices_moved: AtomicU64,
    pub devices_deleted: AtomicU64,
    pub entities_expired: AtomicU64,
    pub cleanup_runs: AtomicU64,
    /// Observations rejected by the admission policy.
    pub observations_not_allowed: AtomicU64,
    /// Observations skipped because they arrived on a non-learnable port.
    pub non_learnable_port_skips: AtomicU64,
    /// Learn-loop restarts due to detected concurrent modification.
    pub learn_retries: AtomicU64,
}

impl TrackerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            devices_learned: self.devices_learned.load(Ordering::Relaxed),
            devices_changed: self.devices_changed.load(Ordering::Relaxed),
            devices_moved: self.devices_moved.load(Ordering::Relaxed),
            devices_deleted: self.devices_deleted.load(Ordering::Relaxed),
            entities_expired: self.entities_expired.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            observations_not_allowed: self.observations_not_allowed.load(Ordering::Relaxed),
            non_learnable_port_skips: self.non_learnable_port_skips.load(Ordering::Relaxed),
            learn_retries: self.learn_retries.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value view of [`TrackerStats`], serializable for export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStatsSnapshot {
    pub devices_learned: u64,
    pub devices_changed: u64,
    pub devices_moved: u64,
    pub devices_deleted: u64,
    pub entities_expired: u64,
    pub cleanup_runs: u64,
    pub observations_not_allowed: u64,
    pub non_learnable_port_skips: u64,
    pub learn_retries: u64,
}
