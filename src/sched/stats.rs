//! Per-core scheduling statistics.
//!
//! Plain relaxed counters, bumped from the hot paths and exported as a
//! serializable snapshot. The counters are observational only; nothing in
//! the scheduler branches on them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one core.
#[derive(Debug, Default)]
pub(crate) struct CoreStats {
    steals: AtomicU64,
    pauses: AtomicU64,
    unpauses: AtomicU64,
    lifo: AtomicU64,
    sweeps: AtomicU64,
    leaks: AtomicU64,
}

impl CoreStats {
    /// A cown was stolen from another core's queue.
    pub(crate) fn steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    /// The servicing thread parked and was later woken.
    pub(crate) fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    /// An enqueue on this core woke a parked thread.
    pub(crate) fn unpause(&self) {
        self.unpauses.fetch_add(1, Ordering::Relaxed);
    }

    /// A cown was LIFO-scheduled onto this core.
    pub(crate) fn lifo(&self) {
        self.lifo.fetch_add(1, Ordering::Relaxed);
    }

    /// The leak-detection sweep ran over this core.
    pub(crate) fn sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// A still-referenced cown was reported instead of reclaimed at
    /// teardown.
    pub(crate) fn leak(&self) {
        self.leaks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            steals: self.steals.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
            unpauses: self.unpauses.load(Ordering::Relaxed),
            lifo: self.lifo.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            leaks: self.leaks.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of one core's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Cowns stolen from other cores by this core's thread.
    pub steals: u64,
    /// Times this core's thread parked and was woken again.
    pub pauses: u64,
    /// Parked threads woken by enqueues on this core.
    pub unpauses: u64,
    /// Cowns LIFO-scheduled onto this core.
    pub lifo: u64,
    /// Leak-detection sweeps run over this core.
    pub sweeps: u64,
    /// Cowns reported as leaked at teardown.
    pub leaks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = CoreStats::default();
        stats.steal();
        stats.steal();
        stats.pause();
        stats.lifo();
        stats.sweep();
        let snap = stats.snapshot();
        assert_eq!(snap.steals, 2);
        assert_eq!(snap.pauses, 1);
        assert_eq!(snap.unpauses, 0);
        assert_eq!(snap.lifo, 1);
        assert_eq!(snap.sweeps, 1);
        assert_eq!(snap.leaks, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = CoreStats::default();
        stats.unpause();
        let json = serde_json::to_string(&stats.snapshot()).expect("snapshot serializes");
        assert!(json.contains("\"unpauses\":1"), "json = {json}");
    }
}
