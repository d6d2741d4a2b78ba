//! The thread pool: owns the cores, spawns one scheduler thread per core,
//! and hosts everything the threads coordinate through — the pause/unpause
//! parking state, the teardown barrier, the inflight-message counter, the
//! global reclamation epoch, and the LD vote coordinator.
//!
//! Parking follows a permit protocol: `unpause` hands a permit to a parked
//! thread when there is one, and otherwise leaves a single standing permit
//! so a thread that was just about to park consumes it and re-checks its
//! queues instead of sleeping through the wakeup.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::sched::core::Core;
use crate::sched::cown::{CownRef, Work};
use crate::sched::epoch::GlobalEpoch;
use crate::sched::ld::{LdCoordinator, LdState};
use crate::sched::stats::StatsSnapshot;
use crate::sched::thread::{SchedulerThread, ThreadHandle};
use crate::tracing_compat::debug;

thread_local! {
    static CURRENT: RefCell<Option<LocalScheduler>> = const { RefCell::new(None) };
}

/// The scheduler servicing the current OS thread, if any.
#[derive(Debug, Clone)]
pub(crate) struct LocalScheduler {
    pool: Arc<ThreadPool>,
    handle: Arc<ThreadHandle>,
    core: Arc<Core>,
}

impl LocalScheduler {
    pub(crate) fn new(pool: Arc<ThreadPool>, handle: Arc<ThreadHandle>, core: Arc<Core>) -> Self {
        Self { pool, handle, core }
    }
}

/// Installs `local` as the current scheduler for this OS thread; dropping
/// the guard restores the previous value so the thread can be reused.
pub(crate) fn set_current(local: LocalScheduler) -> CurrentSchedulerGuard {
    let prev = CURRENT.with(|slot| slot.replace(Some(local)));
    CurrentSchedulerGuard { prev }
}

pub(crate) struct CurrentSchedulerGuard {
    prev: Option<LocalScheduler>,
}

impl Drop for CurrentSchedulerGuard {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.replace(self.prev.take()));
    }
}

#[derive(Debug, Default)]
struct SleeperState {
    sleeping: usize,
    permits: usize,
    stopped: bool,
}

#[derive(Debug)]
struct Sleepers {
    state: Mutex<SleeperState>,
    cvar: Condvar,
}

/// A pool of scheduler threads, one per core.
#[derive(Debug)]
pub struct ThreadPool {
    cores: Vec<Arc<Core>>,
    handles: Vec<Arc<ThreadHandle>>,
    coordinator: LdCoordinator,
    sleepers: Sleepers,
    barrier: Barrier,
    global_epoch: Arc<GlobalEpoch>,
    inflight: AtomicIsize,
    next_inject: AtomicUsize,
    launched: AtomicBool,
    fair: bool,
    detect_leaks: bool,
    steal_quiescence: Duration,
    seed: u64,
}

impl ThreadPool {
    /// Builds a pool from a validated configuration. No threads start
    /// until [`ThreadPool::run`].
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let global_epoch = Arc::new(GlobalEpoch::new());
        let cores: Vec<Arc<Core>> = (0..config.threads)
            .map(|index| Core::new(index, Arc::clone(&global_epoch)))
            .collect();
        for (index, core) in cores.iter().enumerate() {
            core.set_next(Arc::clone(&cores[(index + 1) % cores.len()]));
        }
        let handles = (0..config.threads)
            .map(|index| Arc::new(ThreadHandle::new(index)))
            .collect();

        Ok(Arc::new(Self {
            cores,
            handles,
            coordinator: LdCoordinator::new(config.threads),
            sleepers: Sleepers {
                state: Mutex::new(SleeperState::default()),
                cvar: Condvar::new(),
            },
            barrier: Barrier::new(config.threads),
            global_epoch,
            inflight: AtomicIsize::new(0),
            next_inject: AtomicUsize::new(0),
            launched: AtomicBool::new(false),
            fair: config.fair,
            detect_leaks: config.detect_leaks,
            steal_quiescence: config.steal_quiescence,
            seed: config.seed,
        }))
    }

    /// Spawns one scheduler thread per core and blocks until all of them
    /// have torn down. Returns an error if the pool has already run.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        self.run_with_startup(|| {})
    }

    /// Like [`ThreadPool::run`], with a startup function executed on every
    /// scheduler thread before its loop starts. Embedders use it to
    /// initialise thread-local state.
    pub fn run_with_startup<F>(self: &Arc<Self>, startup: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self
            .launched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(ErrorKind::AlreadyRunning));
        }

        let startup = Arc::new(startup);
        let mut joins = Vec::with_capacity(self.cores.len());
        for index in 0..self.cores.len() {
            let pool = Arc::clone(self);
            let startup = Arc::clone(&startup);
            let join = thread::Builder::new()
                .name(format!("cownsched-{index}"))
                .spawn(move || {
                    SchedulerThread::new(pool, index).run(move || (*startup)());
                })?;
            joins.push(join);
        }

        let mut result = Ok(());
        for join in joins {
            if join.join().is_err() {
                result = Err(Error::new(ErrorKind::WorkerPanicked));
            }
        }
        result
    }

    /// Orders every scheduler thread to wind down and wakes the sleepers.
    pub fn stop(&self) {
        debug!("pool stop requested");
        let mut state = self.sleepers.state.lock();
        state.stopped = true;
        for handle in &self.handles {
            handle.stop();
        }
        drop(state);
        self.sleepers.cvar.notify_all();
    }

    /// Schedules a cown.
    ///
    /// On a scheduler thread of this pool the cown is FIFO-enqueued on the
    /// local core; from any other thread it is LIFO-injected round-robin,
    /// the path external sources such as I/O completions use.
    pub fn schedule(self: &Arc<Self>, cown: CownRef) {
        let handled = CURRENT.with(|slot| {
            let borrow = slot.borrow();
            let Some(local) = borrow.as_ref() else {
                return false;
            };
            if !Arc::ptr_eq(&local.pool, self) {
                return false;
            }
            if cown.wake() {
                if !cown.scanned(local.handle.send_epoch()) {
                    local.handle.set_unscanned();
                }
                local.core.q().enqueue(Work::Cown(Arc::clone(&cown)));
                if local.pool.unpause() {
                    local.core.stats().unpause();
                }
            }
            true
        });
        if !handled {
            let index = self.next_inject.fetch_add(1, Ordering::Relaxed) % self.cores.len();
            self.schedule_lifo(index, cown);
        }
    }

    /// LIFO-schedules a cown at the front of the given core's queue. Any
    /// thread may call this.
    pub fn schedule_lifo(&self, core_index: usize, cown: CownRef) {
        let core = &self.cores[core_index];
        if core.lifo(cown) && self.unpause() {
            core.stats().unpause();
        }
    }

    /// Requests a leak-detection cycle; idle threads will start voting.
    pub fn request_ld(&self) {
        self.coordinator.request();
        // Parked threads cannot vote; wake everything so the cycle starts
        // even on a fully idle pool.
        while self.unpause() {}
    }

    /// True while a requested leak-detection cycle has not yet completed.
    #[must_use]
    pub fn ld_requested(&self) -> bool {
        self.coordinator.requested()
    }

    /// True while the pool is in a scanning phase of leak detection.
    #[must_use]
    pub fn should_scan(&self) -> bool {
        self.coordinator.should_scan()
    }

    /// Records a message handed to another cown; leak detection will not
    /// declare scanning complete while messages are in flight.
    pub fn message_sent(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    /// Records a delivered message.
    pub fn message_received(&self) {
        let prev = self.inflight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "inflight message count underflow");
    }

    /// True when no messages are in transit anywhere in the pool.
    #[must_use]
    pub fn no_inflight_messages(&self) -> bool {
        self.inflight.load(Ordering::Acquire) == 0
    }

    /// Number of cores (and scheduler threads) in the pool.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// A snapshot of one core's counters.
    #[must_use]
    pub fn stats(&self, core_index: usize) -> StatsSnapshot {
        self.cores[core_index].stats().snapshot()
    }

    /// The progress counter of one core: behaviours executed on or on
    /// behalf of it.
    #[must_use]
    pub fn progress(&self, core_index: usize) -> u64 {
        self.cores[core_index].progress()
    }

    // ── Host contract for the scheduler threads ──────────────────────────

    pub(crate) fn core(&self, index: usize) -> &Arc<Core> {
        &self.cores[index]
    }

    pub(crate) fn handle(&self, index: usize) -> &Arc<ThreadHandle> {
        &self.handles[index]
    }

    pub(crate) fn fair(&self) -> bool {
        self.fair
    }

    pub(crate) fn detect_leaks(&self) -> bool {
        self.detect_leaks
    }

    pub(crate) fn steal_quiescence(&self) -> Duration {
        self.steal_quiescence
    }

    pub(crate) fn seed(&self) -> u64 {
        self.seed
    }

    pub(crate) fn global_epoch(&self) -> &Arc<GlobalEpoch> {
        &self.global_epoch
    }

    /// Offers `current` as this thread's protocol vote and returns the
    /// state to move to.
    pub(crate) fn next_state(&self, handle: &ThreadHandle, current: LdState) -> LdState {
        self.coordinator.next_state(handle.index(), current)
    }

    /// Parks the calling thread until a permit arrives. Returns `false`
    /// when the pool has been stopped — the caller's run flag is already
    /// down by then.
    pub(crate) fn pause(&self) -> bool {
        let mut state = self.sleepers.state.lock();
        loop {
            if state.stopped {
                return false;
            }
            if state.permits > 0 {
                state.permits -= 1;
                return true;
            }
            state.sleeping += 1;
            self.sleepers.cvar.wait(&mut state);
            state.sleeping -= 1;
        }
    }

    /// Wakes one parked thread. Returns true iff a sleeper was actually
    /// woken; with no sleeper a single standing permit is left so a thread
    /// racing towards `pause` consumes it and re-checks its queues.
    pub fn unpause(&self) -> bool {
        let mut state = self.sleepers.state.lock();
        if state.stopped {
            return false;
        }
        if state.sleeping > state.permits {
            state.permits += 1;
            self.sleepers.cvar.notify_one();
            true
        } else {
            state.permits = state.permits.max(1);
            false
        }
    }

    /// Teardown rendezvous: every scheduler thread arrives here between
    /// the two teardown phases.
    pub(crate) fn enter_barrier(&self) {
        self.barrier.wait();
    }

    #[cfg(test)]
    pub(crate) fn sleeper_count(&self) -> usize {
        self.sleepers.state.lock().sleeping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::cown::{Behaviour, Cown, RunContext};
    use std::time::Instant;

    struct Nop;
    impl Behaviour for Nop {
        fn run(&mut self, _ctx: &mut RunContext<'_>) -> bool {
            false
        }
    }

    fn pool(threads: usize) -> Arc<ThreadPool> {
        ThreadPool::new(SchedulerConfig::with_threads(threads)).expect("pool")
    }

    #[test]
    fn test_cores_form_a_ring() {
        let pool = pool(3);
        let start = pool.core(0);
        let second = start.next();
        let third = second.next();
        assert_eq!(second.index(), 1);
        assert_eq!(third.index(), 2);
        assert!(Arc::ptr_eq(third.next(), start));
    }

    #[test]
    fn test_single_core_ring_links_to_itself() {
        let pool = pool(1);
        assert!(Arc::ptr_eq(pool.core(0).next(), pool.core(0)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = ThreadPool::new(SchedulerConfig::with_threads(0))
            .map(|_| ())
            .expect_err("zero threads must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_unpause_without_sleeper_leaves_standing_permit() {
        let pool = pool(1);
        assert!(!pool.unpause(), "no sleeper to wake");
        // The standing permit makes the next pause return immediately.
        let start = Instant::now();
        assert!(pool.pause());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_pause_returns_false_after_stop() {
        let pool = pool(1);
        pool.stop();
        assert!(!pool.pause());
        assert!(!pool.unpause());
    }

    #[test]
    fn test_unpause_wakes_parked_thread() {
        let pool = pool(1);
        let parked = Arc::clone(&pool);
        let join = thread::spawn(move || parked.pause());
        // Wait until the thread is actually parked before waking it, so the
        // wake cannot be satisfied by a standing permit.
        while pool.sleeper_count() == 0 {
            thread::yield_now();
        }
        assert!(pool.unpause(), "a sleeper must be woken");
        assert!(join.join().expect("parked thread"), "woken, not stopped");
    }

    #[test]
    fn test_schedule_lifo_counts_stat() {
        let pool = pool(2);
        let cown = Cown::new(Nop);
        pool.schedule_lifo(1, cown);
        assert_eq!(pool.stats(1).lifo, 1);
        assert_eq!(pool.stats(0).lifo, 0);
    }

    #[test]
    fn test_schedule_off_thread_round_robins() {
        let pool = pool(2);
        pool.schedule(Cown::new(Nop));
        pool.schedule(Cown::new(Nop));
        assert_eq!(pool.stats(0).lifo + pool.stats(1).lifo, 2);
        assert_eq!(pool.stats(0).lifo, 1);
        assert_eq!(pool.stats(1).lifo, 1);
    }

    #[test]
    fn test_inflight_message_accounting() {
        let pool = pool(1);
        assert!(pool.no_inflight_messages());
        pool.message_sent();
        assert!(!pool.no_inflight_messages());
        pool.message_received();
        assert!(pool.no_inflight_messages());
    }

    #[test]
    fn test_double_run_rejected() {
        let pool = pool(1);
        pool.stop();
        pool.run().expect("stopped pool runs to completion");
        let err = pool.run().expect_err("second run must fail");
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
    }
}
