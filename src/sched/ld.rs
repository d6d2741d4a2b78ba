//! The leak-detection (LD) protocol: states and the vote coordinator.
//!
//! Cycle collection needs every scheduler thread to agree that scanning has
//! started, that scanning has finished, that no unscanned work is still in
//! flight, and only then to sweep. The agreement is reached by voting: each
//! thread repeatedly offers its current state to the coordinator, which
//! answers with the state the thread should move to next (possibly the same
//! state, meaning "no transition").
//!
//! The coordinator keeps the last state each thread published plus a global
//! phase. A phase advances only when every thread has arrived in it, with
//! exact-match predicates so a stale vote from an earlier round can never
//! satisfy a later barrier — in particular, threads falling back from the
//! believe-done votes to a fresh scan round cannot deadlock against threads
//! still holding their old votes.
//!
//! All observable effects (epoch flips, core scans, sweeps) happen when a
//! thread acts on its own transition; the coordinator only counts votes.
//! That keeps the ladder testable by driving it with synthetic vote
//! sequences.

use core::fmt;

use parking_lot::Mutex;

use crate::tracing_compat::debug;

/// A scheduler thread's position in the leak-detection protocol.
///
/// The vote order is the declaration order; a cycle runs top to bottom and
/// wraps back to [`LdState::NotInLd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LdState {
    /// Not participating in a leak-detection cycle.
    NotInLd,
    /// Asking the other threads to start a cycle.
    WantLd,
    /// Cycle starting: new messages are no longer counted as scanned.
    PreScan,
    /// Scanning: the send epoch has flipped and the core scan has run.
    Scan,
    /// Every thread has entered scan.
    AllInScan,
    /// This thread believes scanning is complete.
    BelieveDoneVote,
    /// Every thread believes scanning is complete; decide confirm/retract.
    BelieveDone,
    /// No unscanned work was observed here since scan entry.
    BelieveDoneConfirm,
    /// Unscanned work was observed here; the cycle must rescan.
    BelieveDoneRetract,
    /// Every thread confirmed; sweeping is now safe.
    ReallyDoneConfirm,
    /// Sweeping unreachable cowns.
    Sweep,
    /// Sweep complete on this thread.
    Finished,
}

impl fmt::Display for LdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotInLd => "NotInLD",
            Self::WantLd => "WantLD",
            Self::PreScan => "PreScan",
            Self::Scan => "Scan",
            Self::AllInScan => "AllInScan",
            Self::BelieveDoneVote => "BelieveDone_Vote",
            Self::BelieveDone => "BelieveDone",
            Self::BelieveDoneConfirm => "BelieveDone_Confirm",
            Self::BelieveDoneRetract => "BelieveDone_Retract",
            Self::ReallyDoneConfirm => "ReallyDone_Confirm",
            Self::Sweep => "Sweep",
            Self::Finished => "Finished",
        };
        f.write_str(name)
    }
}

/// Aggregate phase of the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlobalPhase {
    /// No cycle in progress.
    Idle,
    /// Dragging every thread into prescan.
    PreScan,
    /// Every thread reached prescan; scanning.
    Scan,
    /// Every thread reached scan.
    AllInScan,
    /// Every thread voted believe-done; collecting confirm/retract.
    BelieveDone,
    /// Every thread confirmed.
    ReallyDone,
    /// Sweeping.
    Sweep,
    /// Every thread swept; waiting for the wrap back to idle.
    Finished,
}

#[derive(Debug)]
struct CoordinatorInner {
    global: GlobalPhase,
    states: Vec<LdState>,
    requested: bool,
}

/// The pool-wide vote coordinator.
#[derive(Debug)]
pub(crate) struct LdCoordinator {
    inner: Mutex<CoordinatorInner>,
}

impl LdCoordinator {
    pub(crate) fn new(threads: usize) -> Self {
        Self {
            inner: Mutex::new(CoordinatorInner {
                global: GlobalPhase::Idle,
                states: vec![LdState::NotInLd; threads],
                requested: false,
            }),
        }
    }

    /// Requests a leak-detection cycle. Idle threads pick this up and vote
    /// [`LdState::WantLd`]; the flag clears when the cycle completes.
    pub(crate) fn request(&self) {
        self.inner.lock().requested = true;
    }

    /// True while a cycle has been requested and not yet completed.
    pub(crate) fn requested(&self) -> bool {
        self.inner.lock().requested
    }

    /// True while the pool is in a scanning phase: messages sent now must
    /// be epoch-checked by their receivers.
    pub(crate) fn should_scan(&self) -> bool {
        matches!(
            self.inner.lock().global,
            GlobalPhase::PreScan
                | GlobalPhase::Scan
                | GlobalPhase::AllInScan
                | GlobalPhase::BelieveDone
        )
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> GlobalPhase {
        self.inner.lock().global
    }

    /// Publishes `current` as thread `index`'s state and answers with the
    /// state the thread should move to. Answering `current` means no
    /// transition.
    pub(crate) fn next_state(&self, index: usize, current: LdState) -> LdState {
        let mut inner = self.inner.lock();
        inner.states[index] = current;

        let all = |inner: &CoordinatorInner, wanted: LdState| {
            inner.states.iter().all(|s| *s == wanted)
        };

        let next = match inner.global {
            GlobalPhase::Idle => match current {
                LdState::WantLd => {
                    inner.global = GlobalPhase::PreScan;
                    LdState::PreScan
                }
                // Stragglers wrapping up the previous cycle come home.
                LdState::Finished => LdState::NotInLd,
                other => other,
            },
            GlobalPhase::PreScan => match current {
                LdState::NotInLd | LdState::WantLd => LdState::PreScan,
                LdState::PreScan if all(&inner, LdState::PreScan) => {
                    inner.global = GlobalPhase::Scan;
                    LdState::Scan
                }
                other => other,
            },
            GlobalPhase::Scan => match current {
                LdState::PreScan
                | LdState::BelieveDoneConfirm
                | LdState::BelieveDoneRetract => LdState::Scan,
                LdState::Scan if all(&inner, LdState::Scan) => {
                    inner.global = GlobalPhase::AllInScan;
                    LdState::AllInScan
                }
                other => other,
            },
            GlobalPhase::AllInScan => match current {
                LdState::Scan => LdState::AllInScan,
                LdState::BelieveDoneVote if all(&inner, LdState::BelieveDoneVote) => {
                    inner.global = GlobalPhase::BelieveDone;
                    LdState::BelieveDone
                }
                other => other,
            },
            GlobalPhase::BelieveDone => match current {
                LdState::BelieveDoneVote => LdState::BelieveDone,
                LdState::BelieveDoneConfirm | LdState::BelieveDoneRetract => {
                    let voted = inner.states.iter().all(|s| {
                        matches!(
                            s,
                            LdState::BelieveDoneConfirm | LdState::BelieveDoneRetract
                        )
                    });
                    if voted {
                        if inner
                            .states
                            .iter()
                            .any(|s| *s == LdState::BelieveDoneRetract)
                        {
                            inner.global = GlobalPhase::Scan;
                            LdState::Scan
                        } else {
                            inner.global = GlobalPhase::ReallyDone;
                            LdState::ReallyDoneConfirm
                        }
                    } else {
                        current
                    }
                }
                other => other,
            },
            GlobalPhase::ReallyDone => match current {
                LdState::BelieveDoneConfirm => LdState::ReallyDoneConfirm,
                LdState::ReallyDoneConfirm if all(&inner, LdState::ReallyDoneConfirm) => {
                    inner.global = GlobalPhase::Sweep;
                    LdState::Sweep
                }
                other => other,
            },
            GlobalPhase::Sweep => match current {
                LdState::ReallyDoneConfirm => LdState::Sweep,
                LdState::Sweep if all(&inner, LdState::Sweep) => {
                    inner.global = GlobalPhase::Finished;
                    LdState::Finished
                }
                other => other,
            },
            GlobalPhase::Finished => match current {
                LdState::Sweep => LdState::Finished,
                LdState::Finished if all(&inner, LdState::Finished) => {
                    inner.global = GlobalPhase::Idle;
                    inner.requested = false;
                    debug!("ld cycle complete");
                    LdState::NotInLd
                }
                other => other,
            },
        };
        next
    }
}
