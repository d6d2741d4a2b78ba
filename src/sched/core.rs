//! Cores: one per scheduler thread, linked into a ring for stealing.
//!
//! A core owns the work queue, the resident token cown, the registry of
//! cowns bound to it, and the aggregate counters the run loop and the stub
//! collector maintain. At most one scheduler thread normally services a
//! core; `servicing_threads` tracks the actual count so the last thread to
//! leave can destroy the queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::sched::cown::{CownRef, Work};
use crate::sched::epoch::{EpochMark, GlobalEpoch};
use crate::sched::queue::MpmcQueue;
use crate::sched::stats::CoreStats;
use crate::tracing_compat::trace;

/// A physical-core slot: queue, token, counters, and the cowns bound here.
pub(crate) struct Core {
    index: usize,
    q: MpmcQueue,
    token: OnceLock<CownRef>,
    next: OnceLock<Arc<Core>>,
    cowns: Mutex<Vec<CownRef>>,
    total_cowns: AtomicUsize,
    free_cowns: AtomicUsize,
    progress_counter: AtomicU64,
    last_worker: AtomicUsize,
    servicing_threads: AtomicUsize,
    stats: CoreStats,
}

// The ring link makes a derived Debug recurse; print the counters only.
impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("index", &self.index)
            .field("total_cowns", &self.total_cowns())
            .field("free_cowns", &self.free_cowns())
            .field("servicing_threads", &self.servicing_threads())
            .finish_non_exhaustive()
    }
}

impl Core {
    /// Creates a core with its token already resident in the queue.
    pub(crate) fn new(index: usize, epoch: Arc<GlobalEpoch>) -> Arc<Self> {
        let core = Arc::new(Self {
            index,
            q: MpmcQueue::new(epoch),
            token: OnceLock::new(),
            next: OnceLock::new(),
            cowns: Mutex::new(Vec::new()),
            total_cowns: AtomicUsize::new(0),
            free_cowns: AtomicUsize::new(0),
            progress_counter: AtomicU64::new(0),
            last_worker: AtomicUsize::new(usize::MAX),
            servicing_threads: AtomicUsize::new(0),
            stats: CoreStats::default(),
        });
        let token = crate::sched::cown::Cown::new_token();
        token.bind_core(&core);
        core.q.enqueue(Work::Token(Arc::clone(&token)));
        core.token
            .set(token)
            .expect("core token initialized twice");
        core
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn q(&self) -> &MpmcQueue {
        &self.q
    }

    pub(crate) fn stats(&self) -> &CoreStats {
        &self.stats
    }

    /// This core's resident token cown.
    pub(crate) fn token(&self) -> &CownRef {
        self.token.get().expect("core token not initialized")
    }

    /// Links this core to the next core in the ring.
    pub(crate) fn set_next(&self, next: Arc<Core>) {
        self.next.set(next).expect("core ring linked twice");
    }

    /// The next core in the ring.
    pub(crate) fn next(&self) -> &Arc<Core> {
        self.next.get().expect("core ring not linked")
    }

    // ── Cown registry ────────────────────────────────────────────────────

    /// Registers a cown as owned by this core.
    pub(crate) fn add_cown(&self, cown: CownRef) {
        self.cowns.lock().push(cown);
    }

    /// Removes and returns the whole registry; the stub collector walks it
    /// and reinserts the survivors with [`Core::add_cowns`].
    pub(crate) fn drain(&self) -> Vec<CownRef> {
        std::mem::take(&mut *self.cowns.lock())
    }

    /// Reinserts surviving cowns after a stub-collection pass.
    pub(crate) fn add_cowns(&self, survivors: impl IntoIterator<Item = CownRef>) {
        self.cowns.lock().extend(survivors);
    }

    /// LIFO-schedules a cown onto this core if it was asleep. Returns true
    /// if the cown was enqueued by this call.
    pub(crate) fn lifo(&self, cown: CownRef) -> bool {
        if !cown.wake() {
            return false;
        }
        self.q.enqueue_front(Work::Cown(cown));
        self.stats.lifo();
        true
    }

    /// Marks every owned cown as scanned in `epoch` and wakes the sleepers
    /// with an empty message so they flush their mailboxes during the scan.
    pub(crate) fn scan(&self, epoch: EpochMark) {
        let cowns = self.cowns.lock();
        for cown in cowns.iter() {
            if !cown.scanned(epoch) {
                cown.mark_scanned(epoch);
            }
            if cown.wake() {
                self.q.enqueue_front(Work::Cown(Arc::clone(cown)));
                self.stats.lifo();
            }
        }
        trace!(core = self.index, count = cowns.len(), "core scanned");
    }

    /// Sweep pass: retires cowns the scan did not reach in `epoch`. Their
    /// stubs stay in the registry until the stub collector observes an
    /// outdated pop epoch.
    pub(crate) fn try_collect(&self, epoch: EpochMark) {
        let mut retired = 0usize;
        {
            let cowns = self.cowns.lock();
            for cown in cowns.iter() {
                if !cown.scanned(epoch) && cown.is_sleeping() && cown.mark_collected() {
                    self.note_free_cown();
                    retired += 1;
                }
            }
        }
        self.stats.sweep();
        trace!(core = self.index, retired, "sweep collected");
    }

    /// Teardown phase 1: abandons whatever work is still queued. The token
    /// stays resident for `destroy`.
    pub(crate) fn collect(&self) {
        let mut dropped = 0usize;
        loop {
            match self.q.dequeue() {
                Some(Work::Cown(cown)) => {
                    cown.sleep();
                    dropped += 1;
                }
                Some(token) => self.q.enqueue(token),
                None => break,
            }
        }
        trace!(core = self.index, dropped, "core collected");
    }

    // ── Counters ─────────────────────────────────────────────────────────

    pub(crate) fn inc_total_cowns(&self) {
        self.total_cowns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn total_cowns(&self) -> usize {
        self.total_cowns.load(Ordering::Relaxed)
    }

    pub(crate) fn free_cowns(&self) -> usize {
        self.free_cowns.load(Ordering::Relaxed)
    }

    /// A cown owned here became eligible for stub collection.
    pub(crate) fn note_free_cown(&self) {
        self.free_cowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtracts collected stubs (and teardown leaks) from the counters.
    pub(crate) fn retire_cowns(&self, removed: usize, leaked: usize) {
        self.free_cowns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(removed))
            })
            .ok();
        self.total_cowns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(removed + leaked))
            })
            .ok();
    }

    /// True when at least half the cowns bound here are collectible.
    pub(crate) fn stub_collection_due(&self) -> bool {
        self.total_cowns() < self.free_cowns() << 1
    }

    pub(crate) fn bump_progress(&self) {
        self.progress_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn progress(&self) -> u64 {
        self.progress_counter.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_worker(&self, worker: usize) {
        self.last_worker.store(worker, Ordering::Relaxed);
    }

    /// Index of the thread that most recently executed a cown here.
    pub(crate) fn last_worker(&self) -> usize {
        self.last_worker.load(Ordering::Relaxed)
    }

    // ── Servicing threads ────────────────────────────────────────────────

    pub(crate) fn enter_servicing(&self) {
        self.servicing_threads.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn servicing_threads(&self) -> usize {
        self.servicing_threads.load(Ordering::Acquire)
    }

    /// Leaves the core at teardown. The thread that brings the count to
    /// zero destroys the queue; returns true for exactly that thread.
    pub(crate) fn release_servicing(&self) -> bool {
        let prev = self.servicing_threads.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "servicing count underflow");
        if prev == 1 {
            self.q.destroy();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::cown::{Behaviour, Cown, RunContext};
    use std::sync::Barrier;
    use std::thread;

    struct Nop;
    impl Behaviour for Nop {
        fn run(&mut self, _ctx: &mut RunContext<'_>) -> bool {
            false
        }
    }

    fn core() -> Arc<Core> {
        Core::new(0, Arc::new(GlobalEpoch::new()))
    }

    #[test]
    fn test_new_core_has_resident_token() {
        let core = core();
        assert_eq!(core.q().len(), 1);
        assert!(core.q().nothing_old());
        assert!(core.q().dequeue().is_none());
        let token = core.token();
        assert!(token.is_token());
        assert!(Arc::ptr_eq(token.owning_core().expect("token bound"), &core));
    }

    #[test]
    fn test_progress_and_last_worker_tracking() {
        let core = core();
        core.bump_progress();
        core.bump_progress();
        core.set_last_worker(7);
        assert_eq!(core.progress(), 2);
        assert_eq!(core.last_worker(), 7);
    }

    #[test]
    fn test_scan_marks_and_wakes_sleepers() {
        let core = core();
        let asleep = Cown::new(Nop);
        let awake = Cown::new(Nop);
        assert!(awake.wake());
        core.add_cown(asleep.clone());
        core.add_cown(awake.clone());

        core.scan(EpochMark::A);

        assert!(asleep.scanned(EpochMark::A));
        assert!(awake.scanned(EpochMark::A));
        // Only the sleeper was enqueued (ahead of the token).
        assert!(!asleep.is_sleeping());
        assert_eq!(core.q().len(), 2);
        assert_eq!(core.stats().snapshot().lifo, 1);
    }

    #[test]
    fn test_sweep_retires_only_unscanned_sleepers() {
        let core = core();
        let reached = Cown::new(Nop);
        reached.mark_scanned(EpochMark::B);
        let unreached = Cown::new(Nop);
        let busy = Cown::new(Nop);
        assert!(busy.wake());
        core.add_cown(reached.clone());
        core.add_cown(unreached.clone());
        core.add_cown(busy.clone());

        core.try_collect(EpochMark::B);

        assert_eq!(reached.weak_count(), 1, "scanned cown survives");
        assert_eq!(unreached.weak_count(), 0, "unscanned sleeper retired");
        assert_eq!(busy.weak_count(), 1, "awake cown survives");
        assert_eq!(core.free_cowns(), 1);
        assert_eq!(core.stats().snapshot().sweeps, 1);
    }

    #[test]
    fn test_collect_abandons_queued_work() {
        let core = core();
        let a = Cown::new(Nop);
        let b = Cown::new(Nop);
        assert!(core.lifo(a.clone()));
        assert!(core.lifo(b.clone()));
        core.collect();
        assert!(a.is_sleeping());
        assert!(b.is_sleeping());
        assert_eq!(core.q().len(), 1, "token survives collect");
    }

    #[test]
    fn test_lifo_respects_wake_race() {
        let core = core();
        let cown = Cown::new(Nop);
        assert!(core.lifo(cown.clone()));
        assert!(!core.lifo(cown), "already awake, must not double-enqueue");
        assert_eq!(core.q().len(), 2);
    }

    #[test]
    fn test_last_servicing_thread_destroys_queue_once() {
        let core = core();
        let threads = 4;
        for _ in 0..threads {
            core.enter_servicing();
        }
        let barrier = Arc::new(Barrier::new(threads));
        let destroyed: Vec<bool> = (0..threads)
            .map(|_| {
                let core = Arc::clone(&core);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    core.release_servicing()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("release thread panicked"))
            .collect();
        assert_eq!(
            destroyed.iter().filter(|d| **d).count(),
            1,
            "exactly one thread must destroy the queue"
        );
        assert_eq!(core.servicing_threads(), 0);
        assert!(core.q().is_destroyed());
    }

    #[test]
    fn test_stub_collection_trigger() {
        let core = core();
        assert!(!core.stub_collection_due());
        core.inc_total_cowns();
        core.inc_total_cowns();
        core.inc_total_cowns();
        core.note_free_cown();
        assert!(!core.stub_collection_due(), "one of three free is not half");
        core.note_free_cown();
        assert!(core.stub_collection_due(), "two of three free crosses half");
    }
}
