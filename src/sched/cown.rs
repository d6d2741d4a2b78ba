//! Cowns: the unit of scheduling.
//!
//! A cown ("concurrent-owned" object) pairs embedder logic — a
//! [`Behaviour`] — with the scheduling metadata the runtime needs: the core
//! the cown is bound to, its scan mark, its weak reference count, the global
//! epoch at which it was last seen in a work queue, and its mailbox state.
//!
//! A cown is executed by at most one thread at a time; the queues enforce
//! this by ownership (being in a queue implies not running, and a cown whose
//! behaviour declines rescheduling is simply not re-enqueued).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::sched::core::Core;
use crate::sched::epoch::{AtomicEpochMark, EpochMark, NO_EPOCH_SET};
use crate::sched::ld::LdState;
use crate::sched::pool::ThreadPool;

/// A shared handle to a cown.
pub type CownRef = Arc<Cown>;

/// Embedder logic executed when a cown's mailbox is serviced.
pub trait Behaviour: Send + 'static {
    /// Runs one behaviour. Returns `true` to be rescheduled, `false` to go
    /// back to sleep until the cown is scheduled again.
    ///
    /// Wakeups can be spurious: the leak detector's scan sends an empty
    /// message to every sleeping cown it marks, so a behaviour with no
    /// pending work should simply return `false`.
    fn run(&mut self, ctx: &mut RunContext<'_>) -> bool;
}

/// Context handed to [`Behaviour::run`].
#[derive(Debug)]
pub struct RunContext<'a> {
    ld_state: LdState,
    core_index: usize,
    pool: &'a Arc<ThreadPool>,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(ld_state: LdState, core_index: usize, pool: &'a Arc<ThreadPool>) -> Self {
        Self {
            ld_state,
            core_index,
            pool,
        }
    }

    /// The executing thread's current leak-detection state.
    #[must_use]
    pub fn ld_state(&self) -> LdState {
        self.ld_state
    }

    /// Index of the core executing this behaviour.
    #[must_use]
    pub fn core_index(&self) -> usize {
        self.core_index
    }

    /// The pool executing this behaviour, for scheduling further cowns.
    #[must_use]
    pub fn pool(&self) -> &Arc<ThreadPool> {
        self.pool
    }
}

/// A schedulable concurrent-owned object.
pub struct Cown {
    behaviour: Mutex<Box<dyn Behaviour>>,
    owning_core: OnceLock<Arc<Core>>,
    epoch_mark: AtomicEpochMark,
    weak_count: AtomicUsize,
    epoch_when_popped: AtomicU64,
    sleeping: AtomicBool,
    token: bool,
}

impl std::fmt::Debug for Cown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cown")
            .field("token", &self.token)
            .field("sleeping", &self.is_sleeping())
            .field("weak_count", &self.weak_count())
            .finish_non_exhaustive()
    }
}

impl Cown {
    /// Creates a new cown around the given behaviour.
    ///
    /// The cown starts asleep with one weak reference held by the creator;
    /// release it with [`Cown::release`] once no external stub reference
    /// remains, which makes the metadata eligible for collection.
    #[must_use]
    pub fn new(behaviour: impl Behaviour) -> CownRef {
        Arc::new(Self {
            behaviour: Mutex::new(Box::new(behaviour)),
            owning_core: OnceLock::new(),
            epoch_mark: AtomicEpochMark::new(EpochMark::None),
            weak_count: AtomicUsize::new(1),
            epoch_when_popped: AtomicU64::new(NO_EPOCH_SET),
            sleeping: AtomicBool::new(true),
            token: false,
        })
    }

    /// Creates a core's token cown. The token never runs and is never
    /// asleep: it is resident in its core's queue from construction.
    pub(crate) fn new_token() -> CownRef {
        Arc::new(Self {
            behaviour: Mutex::new(Box::new(TokenBehaviour)),
            owning_core: OnceLock::new(),
            epoch_mark: AtomicEpochMark::new(EpochMark::None),
            weak_count: AtomicUsize::new(1),
            epoch_when_popped: AtomicU64::new(NO_EPOCH_SET),
            sleeping: AtomicBool::new(false),
            token: true,
        })
    }

    /// Runs one behaviour on this cown.
    pub(crate) fn run(&self, ctx: &mut RunContext<'_>) -> bool {
        let mut behaviour = self
            .behaviour
            .try_lock()
            .expect("cown behaviour executed by two threads");
        behaviour.run(ctx)
    }

    /// The core this cown is bound to, if any.
    pub(crate) fn owning_core(&self) -> Option<&Arc<Core>> {
        self.owning_core.get()
    }

    /// Binds the cown to the first core that executes it.
    pub(crate) fn bind_core(&self, core: &Arc<Core>) {
        let bound = self.owning_core.set(Arc::clone(core));
        debug_assert!(bound.is_ok(), "cown bound to a second core");
    }

    /// Returns the cown's scan mark.
    pub(crate) fn epoch_mark(&self) -> EpochMark {
        self.epoch_mark.load()
    }

    /// True if the cown has been scanned in `epoch`.
    pub(crate) fn scanned(&self, epoch: EpochMark) -> bool {
        self.epoch_mark() == epoch
    }

    /// Marks the cown as scanned in `epoch`.
    pub(crate) fn mark_scanned(&self, epoch: EpochMark) {
        self.epoch_mark.store(epoch);
    }

    /// Current weak (stub) reference count.
    pub(crate) fn weak_count(&self) -> usize {
        self.weak_count.load(Ordering::Acquire)
    }

    /// Adds a weak stub reference.
    pub fn retain(&self) {
        self.weak_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a weak stub reference. When the count reaches zero the
    /// cown's metadata becomes eligible for stub collection on its core.
    pub fn release(&self) {
        let prev = self.weak_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "cown weak count underflow");
        if prev == 1 {
            if let Some(core) = self.owning_core() {
                core.note_free_cown();
            }
        }
    }

    /// Forces the weak count to zero. Returns true if it was non-zero.
    ///
    /// Used by the sweep phase to retire cowns the scan did not reach.
    pub(crate) fn mark_collected(&self) -> bool {
        self.weak_count.swap(0, Ordering::AcqRel) > 0
    }

    /// Global epoch at which this cown was last popped from a work queue.
    pub(crate) fn epoch_when_popped(&self) -> u64 {
        self.epoch_when_popped.load(Ordering::Acquire)
    }

    pub(crate) fn set_epoch_when_popped(&self, epoch: u64) {
        self.epoch_when_popped.store(epoch, Ordering::Release);
    }

    /// True while the cown's mailbox is asleep (not queued, not running).
    pub(crate) fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    /// Transitions sleeping -> awake. Returns true if this call made the
    /// transition, i.e. the caller is the one who gets to enqueue the cown.
    pub(crate) fn wake(&self) -> bool {
        self.sleeping
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Puts the mailbox back to sleep after a behaviour declined to be
    /// rescheduled.
    pub(crate) fn sleep(&self) {
        self.sleeping.store(true, Ordering::Release);
    }

    pub(crate) fn is_token(&self) -> bool {
        self.token
    }
}

/// Behaviour of a token cown. The run loop recognizes tokens in `prerun`
/// and re-enqueues them without running, so this is unreachable.
struct TokenBehaviour;

impl Behaviour for TokenBehaviour {
    fn run(&mut self, _ctx: &mut RunContext<'_>) -> bool {
        debug_assert!(false, "token cown is never run");
        false
    }
}

/// A work-queue element: a real cown, or a core's token sentinel.
///
/// This is the crate's rendition of the low-bit pointer tag: the variant
/// carries the tag, and `prerun` is the only consumer that distinguishes
/// the two.
#[derive(Debug, Clone)]
pub(crate) enum Work {
    /// A schedulable cown.
    Cown(CownRef),
    /// A core's token sentinel; never run, always re-enqueued.
    Token(CownRef),
}

impl Work {
    pub(crate) fn is_token(&self) -> bool {
        matches!(self, Self::Token(_))
    }
}
