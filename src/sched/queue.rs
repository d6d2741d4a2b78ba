//! The per-core MPMC work queue.
//!
//! Producers are any thread (FIFO from the owning scheduler, LIFO from
//! external sources such as I/O completions); consumers are the owning
//! scheduler thread and any peer that steals. The queue guarantees no loss
//! and no duplication; a mutexed deque provides the synchronization.
//!
//! The core's token is the queue's stub element: a queue holding only its
//! token reports empty, so an idle thread falls through to stealing instead
//! of spinning on its own sentinel. `nothing_old` is true exactly when the
//! token has reached the front — everything enqueued before it has been
//! drained, which is what the token exists to measure.
//!
//! Dequeueing a real cown stamps it with the current global epoch; the stub
//! collector refuses to reclaim metadata until that stamp is outdated.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sched::cown::Work;
use crate::sched::epoch::GlobalEpoch;

/// MPMC queue of work items with token-stub semantics.
#[derive(Debug)]
pub(crate) struct MpmcQueue {
    inner: Mutex<VecDeque<Work>>,
    epoch: Arc<GlobalEpoch>,
    destroyed: AtomicBool,
}

impl MpmcQueue {
    pub(crate) fn new(epoch: Arc<GlobalEpoch>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            epoch,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Enqueues at the back (FIFO order).
    pub(crate) fn enqueue(&self, work: Work) {
        debug_assert!(!self.is_destroyed(), "enqueue on destroyed queue");
        if let Work::Cown(cown) = &work {
            debug_assert!(!cown.is_sleeping(), "sleeping cown enqueued");
        }
        self.inner.lock().push_back(work);
    }

    /// Enqueues at the front (LIFO order, external wakeups).
    pub(crate) fn enqueue_front(&self, work: Work) {
        debug_assert!(!self.is_destroyed(), "enqueue on destroyed queue");
        if let Work::Cown(cown) = &work {
            debug_assert!(!cown.is_sleeping(), "sleeping cown enqueued");
        }
        self.inner.lock().push_front(work);
    }

    /// Dequeues from the front.
    ///
    /// Returns `None` when the queue is empty or holds only its resident
    /// token. A dequeued cown is stamped with the current global epoch.
    pub(crate) fn dequeue(&self) -> Option<Work> {
        let mut inner = self.inner.lock();
        if inner.len() <= 1 && inner.front().is_some_and(Work::is_token) {
            return None;
        }
        let work = inner.pop_front()?;
        drop(inner);
        if let Work::Cown(cown) = &work {
            cown.set_epoch_when_popped(self.epoch.current());
        }
        Some(work)
    }

    /// True when no work older than the token remains: the front is the
    /// token, or the queue is empty outright.
    pub(crate) fn nothing_old(&self) -> bool {
        self.inner.lock().front().map_or(true, Work::is_token)
    }

    /// Tears the queue down. Only the token may remain at this point.
    pub(crate) fn destroy(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.iter().all(Work::is_token),
            "queue destroyed while work remains"
        );
        inner.clear();
        drop(inner);
        self.destroyed.store(true, Ordering::Release);
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
