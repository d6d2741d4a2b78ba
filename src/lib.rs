//! Cownsched: a per-core scheduler for concurrent-owned objects ("cowns").
//!
//! # Overview
//!
//! A cown is the unit of scheduling: an object owning a mailbox of pending
//! behaviours. Each scheduler thread is pinned to one core, runs the cowns in
//! that core's queue, and periodically steals from its peers so that work
//! spreads across the machine. A sentinel token cown circulates through each
//! queue and measures how fast the queue is being traversed; recognizing the
//! token drives both the fairness stealing policy and the checkpoints of the
//! leak-detection protocol.
//!
//! Three subsystems interleave on every scheduler thread:
//!
//! - a work-stealing run loop with token-based rate control;
//! - a distributed leak-detection (LD) state machine that coordinates, with
//!   no global lock on the hot path, when it is safe to scan and sweep
//!   unreachable cowns across all threads;
//! - epoch-gated reclamation of cown metadata stubs.
//!
//! # Module Structure
//!
//! - [`sched`]: cores, the work queue, the scheduler thread, the thread
//!   pool, and the LD protocol
//! - [`config`]: scheduler configuration and validation
//! - [`error`]: error types for the fallible outer surface
//! - [`util`]: internal utilities (deterministic RNG)
//! - [`tracing_compat`]: logging facade (no-op unless `tracing-integration`)
//!
//! # Example
//!
//! ```no_run
//! use cownsched::{Behaviour, Cown, RunContext, SchedulerConfig, ThreadPool};
//!
//! struct Greeter(u32);
//!
//! impl Behaviour for Greeter {
//!     fn run(&mut self, _ctx: &mut RunContext<'_>) -> bool {
//!         self.0 += 1;
//!         self.0 < 3 // reschedule until we have greeted three times
//!     }
//! }
//!
//! let pool = ThreadPool::new(SchedulerConfig::default()).unwrap();
//! pool.schedule(Cown::new(Greeter(0)));
//! # pool.stop();
//! pool.run().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod error;
pub mod sched;
pub mod tracing_compat;
pub mod util;

pub use config::{ConfigError, SchedulerConfig};
pub use error::{Error, ErrorKind, Result};
pub use sched::{
    Behaviour, Cown, CownRef, EpochMark, LdState, RunContext, StatsSnapshot, ThreadPool,
};
