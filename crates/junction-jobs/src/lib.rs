//! Work execution for the binder: a bounded worker pool with per-group
//! serialization and deadlines, plus a uniform fd readiness source.
//!
//! - [`engine`] — the [`JobEngine`]: FIFO scheduling, group mutual
//!   exclusion, reentrant `enter`/`leave` waits, cooperative cancellation.
//! - [`watchdog`] — deadline supervision of running jobs.
//! - [`fdev`] — descriptor readiness dispatch on the runtime's reactor.

pub mod engine;
pub mod fdev;
pub mod watchdog;

pub use engine::{Group, JobCause, JobConfig, JobContext, JobEngine, JobError, LoopRef};
pub use fdev::{FdInterest, FdRepeat, Fdev};
pub use watchdog::Outcome;
