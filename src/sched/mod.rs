//! The scheduler: cores, cowns, the work queue, the run loop, and the
//! leak-detection protocol.
//!
//! One scheduler thread services one core. Cores form a ring; each thread's
//! victim pointer walks the ring when it steals. The [`ThreadPool`] owns
//! the cores, the parking state, the teardown barrier, and the LD vote
//! coordinator.

pub(crate) mod core;
pub mod cown;
pub mod epoch;
pub mod ld;
pub mod pool;
pub(crate) mod queue;
pub mod stats;
pub(crate) mod thread;

pub use cown::{Behaviour, Cown, CownRef, RunContext};
pub use epoch::EpochMark;
pub use ld::LdState;
pub use pool::ThreadPool;
pub use stats::StatsSnapshot;
