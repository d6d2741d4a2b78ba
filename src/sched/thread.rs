//! The scheduler thread: run loop, steal engine, token recognition, the
//! local side of the leak-detection protocol, and stub collection.
//!
//! The iteration order of the run loop is load-bearing. Stub collection and
//! the fairness steal run before the local dequeue; the unscanned tripwire
//! and the LD step run after `prerun` and before the behaviour executes;
//! the reschedule dance runs last. Reordering these breaks either the
//! fairness scheme or the leak detector's no-premature-advance guarantee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;

use crate::sched::core::Core;
use crate::sched::cown::{CownRef, RunContext, Work};
use crate::sched::epoch::{AtomicEpochMark, EpochMark, NO_EPOCH_SET};
use crate::sched::ld::LdState;
use crate::sched::pool::{self, ThreadPool};
use crate::tracing_compat::{debug, error, trace, warn};
use crate::util::DetRng;

/// The slice of a scheduler thread's state other threads may touch:
/// the stop flag, the unscanned-cown flag, and the published send epoch.
#[derive(Debug)]
pub(crate) struct ThreadHandle {
    index: usize,
    running: AtomicBool,
    scheduled_unscanned_cown: AtomicBool,
    send_epoch: AtomicEpochMark,
}

impl ThreadHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            running: AtomicBool::new(true),
            scheduled_unscanned_cown: AtomicBool::new(false),
            send_epoch: AtomicEpochMark::new(EpochMark::A),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Orders the thread to wind down. Monotonic: never unset.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Latches "an unscanned cown was scheduled here"; release ordering so
    /// the flag is visible before this thread's next protocol vote.
    pub(crate) fn set_unscanned(&self) {
        self.scheduled_unscanned_cown
            .store(true, Ordering::Release);
    }

    pub(crate) fn clear_unscanned(&self) {
        self.scheduled_unscanned_cown
            .store(false, Ordering::Release);
    }

    pub(crate) fn unscanned(&self) -> bool {
        self.scheduled_unscanned_cown.load(Ordering::Acquire)
    }

    pub(crate) fn send_epoch(&self) -> EpochMark {
        self.send_epoch.load()
    }

    pub(crate) fn set_send_epoch(&self, epoch: EpochMark) {
        self.send_epoch.store(epoch);
    }
}

/// One scheduler thread, bound to one core.
pub(crate) struct SchedulerThread {
    pool: Arc<ThreadPool>,
    handle: Arc<ThreadHandle>,
    core: Arc<Core>,
    victim: Arc<Core>,
    state: LdState,
    n_ld_tokens: u8,
    should_steal_for_fairness: bool,
    prev_epoch: EpochMark,
    rng: DetRng,
}

impl SchedulerThread {
    pub(crate) fn new(pool: Arc<ThreadPool>, index: usize) -> Self {
        let handle = Arc::clone(pool.handle(index));
        let core = Arc::clone(pool.core(index));
        let victim = Arc::clone(core.next());
        let rng = DetRng::new(pool.seed().wrapping_add(index as u64 + 1));
        Self {
            pool,
            handle,
            core,
            victim,
            state: LdState::NotInLd,
            n_ld_tokens: 0,
            should_steal_for_fairness: false,
            prev_epoch: EpochMark::B,
            rng,
        }
    }

    fn send_epoch(&self) -> EpochMark {
        self.handle.send_epoch()
    }

    /// Runs the scheduling loop until stealing fails and the pool has
    /// ordered shutdown. `startup` initialises embedder thread-local state
    /// before the first iteration.
    pub(crate) fn run(mut self, startup: impl FnOnce()) {
        startup();

        let _current = pool::set_current(pool::LocalScheduler::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.handle),
            Arc::clone(&self.core),
        ));
        self.core.enter_servicing();
        debug!(core = self.core.index(), "scheduler thread started");

        let mut slot: Option<Work> = None;

        loop {
            if self.core.stub_collection_due() || self.systematic_coin(5) {
                self.collect_cown_stubs(false);
            }

            if self.should_steal_for_fairness && slot.is_none() {
                self.should_steal_for_fairness = false;
                slot = self.fast_steal();
            }

            if slot.is_none() {
                slot = self.core.q().dequeue();
                if slot.is_some() {
                    trace!(core = self.core.index(), "pop work");
                }
            }

            if slot.is_none() {
                slot = self.steal();
                // If we can't steal, we are done.
                if slot.is_none() {
                    break;
                }
            }

            let work = slot.take().expect("work item present");
            let Some(cown) = self.prerun(work) else {
                continue;
            };

            // Keep the LD protocol from advancing while this cown is
            // unscanned. This also catches stolen cowns and reschedules
            // out of an empty queue.
            if self.pool.should_scan() && cown.epoch_mark() != self.send_epoch() {
                trace!("unscanned cown next");
                self.handle.set_unscanned();
            }

            self.ld_protocol();

            // A cown from another core bumps both progress counters: the
            // owner's reflects queue progress, ours CPU utilization.
            let cown_core = Arc::clone(cown.owning_core().expect("cown bound in prerun"));
            cown_core.bump_progress();
            if !Arc::ptr_eq(&cown_core, &self.core) {
                self.core.bump_progress();
            }
            self.core.set_last_worker(self.handle.index());

            trace!(core = self.core.index(), "running cown");
            let mut ctx = RunContext::new(self.state, self.core.index(), &self.pool);
            let reschedule = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                cown.run(&mut ctx)
            }))
            .unwrap_or_else(|_| {
                error!(core = self.core.index(), "cown behaviour panicked");
                false
            });

            if reschedule {
                if self.should_steal_for_fairness {
                    self.schedule_fifo(cown);
                } else {
                    debug_assert!(!cown.is_sleeping());
                    // Push to the back only if something else is queued,
                    // otherwise run this cown again: enqueueing our only
                    // cown invites another thread to steal it.
                    match self.core.q().dequeue() {
                        Some(next) => {
                            self.schedule_fifo(cown);
                            slot = Some(next);
                        }
                        None => {
                            let mut kept = Some(cown);
                            if self.core.q().nothing_old() {
                                trace!(core = self.core.index(), "queue empty");
                                // We have effectively reached the token.
                                self.n_ld_tokens = 0;
                                if self.pool.fair() {
                                    if let Some(stolen) = self.fast_steal() {
                                        let ours = kept.take().expect("kept cown");
                                        self.schedule_fifo(ours);
                                        slot = Some(stolen);
                                    }
                                }
                            }
                            if let Some(ours) = kept {
                                slot = Some(Work::Cown(ours));
                            }
                        }
                    }
                }
            } else {
                cown.sleep();
            }

            self.yield_point();
        }

        self.teardown();
    }

    fn teardown(&mut self) {
        debug!(core = self.core.index(), "begin teardown (phase 1)");
        self.core.collect();
        debug!(core = self.core.index(), "end teardown (phase 1)");

        self.pool.enter_barrier();

        debug!(core = self.core.index(), "begin teardown (phase 2)");
        self.pool.global_epoch().advance();
        self.collect_cown_stubs(true);
        debug!(core = self.core.index(), "end teardown (phase 2)");

        if self.core.release_servicing() {
            debug!(core = self.core.index(), "destroying core queue");
        }
    }

    // ── Steal engine ─────────────────────────────────────────────────────

    /// Single-shot probe of the current victim. Advances the victim on
    /// failure or skip; a hit keeps the victim for locality.
    fn fast_steal(&mut self) -> Option<Work> {
        if !Arc::ptr_eq(&self.victim, &self.core) {
            if let Some(work) = self.victim.q().dequeue() {
                self.core.stats().steal();
                trace!(
                    from = self.victim.index(),
                    to = self.core.index(),
                    "fast-steal"
                );
                return Some(work);
            }
        }
        self.victim = Arc::clone(self.victim.next());
        None
    }

    /// Blocking steal loop: spins through victims, participates in the LD
    /// protocol, and parks once the quiescence window elapses. Returns
    /// `None` only when the pool has ordered shutdown.
    fn steal(&mut self) -> Option<Work> {
        let start = Instant::now();

        while self.handle.is_running() {
            self.yield_point();

            if self.core.q().nothing_old() {
                self.n_ld_tokens = 0;
            }

            self.ld_protocol();

            // Another thread may have pushed onto our queue.
            if let Some(work) = self.core.q().dequeue() {
                return Some(work);
            }

            if !Arc::ptr_eq(&self.victim, &self.core) {
                if let Some(work) = self.victim.q().dequeue() {
                    self.core.stats().steal();
                    trace!(
                        from = self.victim.index(),
                        to = self.core.index(),
                        "steal"
                    );
                    return Some(work);
                }
            }
            self.victim = Arc::clone(self.victim.next());

            if !self.quiescent(start) {
                std::hint::spin_loop();
                continue;
            }

            // Sleep only while not executing the leak detector. While
            // parked, the stop flag may be set, ending the outer loop.
            if self.state == LdState::NotInLd && self.pool.pause() {
                self.core.stats().pause();
            }
        }

        None
    }

    #[cfg(not(feature = "systematic"))]
    fn quiescent(&mut self, start: Instant) -> bool {
        start.elapsed() >= self.pool.steal_quiescence()
    }

    /// Under systematic testing the park gate is a deterministic coin
    /// rather than wall-clock time.
    #[cfg(feature = "systematic")]
    fn quiescent(&mut self, _start: Instant) -> bool {
        self.rng.coin(5)
    }

    #[cfg(not(feature = "systematic"))]
    #[allow(clippy::unused_self)]
    fn systematic_coin(&mut self, _bits: u32) -> bool {
        false
    }

    #[cfg(feature = "systematic")]
    fn systematic_coin(&mut self, bits: u32) -> bool {
        self.rng.coin(bits)
    }

    /// Cooperative interleaving point; a no-op outside systematic testing.
    #[cfg(not(feature = "systematic"))]
    #[allow(clippy::unused_self)]
    fn yield_point(&self) {}

    #[cfg(feature = "systematic")]
    fn yield_point(&self) {
        std::thread::yield_now();
    }

    // ── Prerun / token recognition ───────────────────────────────────────

    /// Administrative work before a dequeued item may run.
    ///
    /// Recognizes tokens — ours arms the fairness steal and pays down the
    /// LD token budget, a stolen one is just returned — and re-enqueues
    /// them; tokens never run. A real cown is bound to this core on first
    /// execution. Returns the cown to run, or `None` for a token.
    fn prerun(&mut self, work: Work) -> Option<CownRef> {
        match work {
            Work::Token(token) => {
                let owner = Arc::clone(token.owning_core().expect("token cown is always bound"));
                if Arc::ptr_eq(&owner, &self.core) {
                    if self.pool.fair() {
                        trace!(core = self.core.index(), "fairness steal armed");
                        self.should_steal_for_fairness = true;
                    }
                    if self.n_ld_tokens > 0 {
                        self.dec_n_ld_tokens();
                    }
                    trace!(core = self.core.index(), "reached token");
                } else {
                    trace!(
                        core = self.core.index(),
                        owner = owner.index(),
                        "reached stolen token"
                    );
                }
                // Put the token back.
                owner.q().enqueue(Work::Token(token));
                None
            }
            Work::Cown(cown) => {
                if cown.owning_core().is_none() {
                    trace!(core = self.core.index(), "bind cown to core");
                    cown.bind_core(&self.core);
                    self.core.add_cown(Arc::clone(&cown));
                    self.core.inc_total_cowns();
                }
                Some(cown)
            }
        }
    }

    fn dec_n_ld_tokens(&mut self) {
        debug_assert!(
            self.n_ld_tokens == 1 || self.n_ld_tokens == 2,
            "ld token budget out of range"
        );
        trace!(core = self.core.index(), "reached ld token");
        self.n_ld_tokens -= 1;
    }

    fn ld_checkpoint_reached(&self) -> bool {
        self.n_ld_tokens == 0
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    /// FIFO-schedules a cown on this thread's core.
    fn schedule_fifo(&mut self, cown: CownRef) {
        if !cown.scanned(self.send_epoch()) {
            trace!(core = self.core.index(), "enqueue unscanned cown");
            self.handle.set_unscanned();
        }
        debug_assert!(!cown.is_sleeping());
        self.core.q().enqueue(Work::Cown(cown));
        if self.pool.unpause() {
            self.core.stats().unpause();
        }
    }

    // ── LD protocol: local side ──────────────────────────────────────────

    /// Plays catch-up with the pool-wide protocol state and votes for new
    /// states when this thread's preconditions hold.
    fn ld_protocol(&mut self) {
        if self.state == LdState::NotInLd && self.pool.ld_requested() {
            self.ld_state_change(LdState::WantLd);
        }

        // Vote believe-done once the checkpoint is reached; if unscanned
        // work or inflight messages remain, rescan instead.
        if self.state == LdState::AllInScan && self.ld_checkpoint_reached() {
            trace!(unscanned = self.handle.unscanned(), "ld checkpoint");
            if !self.handle.unscanned() && self.pool.no_inflight_messages() {
                self.ld_state_change(LdState::BelieveDoneVote);
            } else {
                self.enter_scan();
            }
        }

        let mut first = true;

        loop {
            let sprev = self.state;
            self.yield_point();
            let snext = self.pool.next_state(&self.handle, sprev);

            // A lost wake-up here can strand every thread mid-protocol;
            // poke the sleepers while prescan makes no progress.
            if sprev == LdState::PreScan && snext == LdState::PreScan && self.pool.unpause() {
                self.core.stats().unpause();
            }

            if snext == sprev {
                return;
            }
            self.yield_point();

            if first {
                first = false;
                debug!(core = self.core.index(), "ld protocol loop");
            }

            self.ld_state_change(snext);

            match self.state {
                LdState::PreScan => {
                    if self.pool.unpause() {
                        self.core.stats().unpause();
                    }
                    self.enter_prescan();
                    return;
                }
                LdState::Scan => {
                    // Arriving from before prescan runs the prescan actions
                    // first; re-entry after a retract keeps prev_epoch so
                    // the send epoch does not flip twice in one cycle.
                    if matches!(sprev, LdState::NotInLd | LdState::WantLd) {
                        self.enter_prescan();
                    }
                    self.enter_scan();
                    return;
                }
                LdState::AllInScan => {
                    if sprev == LdState::PreScan {
                        self.enter_scan();
                    }
                    return;
                }
                LdState::BelieveDone => {
                    let vote = if self.handle.unscanned() {
                        LdState::BelieveDoneRetract
                    } else {
                        LdState::BelieveDoneConfirm
                    };
                    self.ld_state_change(vote);
                }
                LdState::Sweep => {
                    self.collect_cowns();
                }
                _ => {}
            }
        }
    }

    fn ld_state_change(&mut self, next: LdState) {
        debug!(
            core = self.core.index(),
            from = %self.state,
            to = %next,
            "ld state change"
        );
        self.state = next;
    }

    fn enter_prescan(&mut self) {
        // New messages sent from here on must not count as scanned; they
        // are inflight work the protocol still has to observe.
        self.prev_epoch = self.send_epoch();
        self.handle.set_send_epoch(EpochMark::None);
        debug!(core = self.core.index(), "enter prescan");
    }

    fn enter_scan(&mut self) {
        let epoch = EpochMark::flip_from(self.prev_epoch);
        self.handle.set_send_epoch(epoch);
        self.core.scan(epoch);
        self.n_ld_tokens = 2;
        self.handle.clear_unscanned();
        debug!(core = self.core.index(), epoch = ?epoch, "enter scan");
    }

    fn collect_cowns(&self) {
        self.core.try_collect(self.send_epoch());
    }

    // ── Stub collection ──────────────────────────────────────────────────

    /// Reclaims the metadata of dead cowns bound to this core.
    ///
    /// A stub goes when its weak count is zero (or unconditionally during
    /// teardown) and its last pop epoch is outdated, so no stale queue
    /// reference can still reach it. Skipped entirely while any thread may
    /// be sweeping the same cowns.
    fn collect_cown_stubs(&mut self, during_teardown: bool) {
        match self.state {
            LdState::ReallyDoneConfirm | LdState::Finished => return,
            _ => {}
        }

        let drained = self.core.drain();
        let count = drained.len();
        let mut survivors: SmallVec<[CownRef; 8]> = SmallVec::new();
        let mut removed = 0usize;
        let mut leaked = 0usize;

        for cown in drained {
            if cown.weak_count() == 0 || during_teardown {
                if cown.weak_count() != 0 && self.pool.detect_leaks() {
                    warn!(core = self.core.index(), cown = ?cown, "leaking cown");
                    self.core.stats().leak();
                    leaked += 1;
                    continue;
                }
                let epoch = cown.epoch_when_popped();
                let outdated =
                    epoch == NO_EPOCH_SET || self.pool.global_epoch().is_outdated(epoch);
                if outdated {
                    removed += 1;
                    trace!(core = self.core.index(), "stub collected cown");
                    drop(cown);
                    continue;
                }
            }
            survivors.push(cown);
        }

        if self.core.servicing_threads() == 1 {
            debug_assert_eq!(self.core.total_cowns(), count, "cown registry drifted");
        } else {
            debug_assert!(count <= self.core.total_cowns(), "cown registry drifted");
        }

        self.core.add_cowns(survivors);
        self.core.retire_cowns(removed, leaked);
        debug!(
            core = self.core.index(),
            removed,
            free = self.core.free_cowns(),
            total = self.core.total_cowns(),
            "stub collection pass"
        );
    }
}
