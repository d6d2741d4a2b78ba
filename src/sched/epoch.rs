//! Epoch marks and the global reclamation epoch.
//!
//! Cowns carry an epoch mark out of `{A, B, None}`. Scanning flips the send
//! epoch between `A` and `B` each leak-detection cycle; a cown is "scanned"
//! when its mark equals the current send epoch. Independently, the pool's
//! [`GlobalEpoch`] is a monotonic counter consulted by the stub collector:
//! a stub may only be reclaimed once the epoch at which it was last seen in
//! a queue is outdated, so no stale queue reference can still reach it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Sentinel for "never observed in a work queue".
pub const NO_EPOCH_SET: u64 = u64::MAX;

/// The scan mark carried by cowns and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EpochMark {
    /// First of the two alternating scan epochs.
    A = 0,
    /// Second of the two alternating scan epochs.
    B = 1,
    /// No epoch: set while in prescan so new work is never counted as
    /// already scanned.
    None = 2,
}

impl EpochMark {
    /// Returns the scan epoch that follows `prev`: the opposite of `B` is
    /// `A`, anything else flips to `B`.
    #[must_use]
    pub const fn flip_from(prev: Self) -> Self {
        match prev {
            Self::B => Self::A,
            Self::A | Self::None => Self::B,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::A,
            1 => Self::B,
            _ => Self::None,
        }
    }
}

/// An atomically readable cell holding an [`EpochMark`].
#[derive(Debug)]
pub(crate) struct AtomicEpochMark(AtomicU8);

impl AtomicEpochMark {
    pub(crate) const fn new(mark: EpochMark) -> Self {
        Self(AtomicU8::new(mark as u8))
    }

    pub(crate) fn load(&self) -> EpochMark {
        EpochMark::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, mark: EpochMark) {
        self.0.store(mark as u8, Ordering::Release);
    }
}

/// The pool-wide monotonic reclamation epoch.
///
/// Advanced behind the teardown barrier, so every pop stamp taken earlier
/// is strictly older than the post-advance value.
#[derive(Debug, Default)]
pub struct GlobalEpoch {
    current: AtomicU64,
}

impl GlobalEpoch {
    /// Creates a fresh epoch counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current epoch value.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Advances the epoch by one.
    pub fn advance(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if `epoch` is strictly older than the current epoch.
    pub fn is_outdated(&self, epoch: u64) -> bool {
        self.current() > epoch
    }
}
