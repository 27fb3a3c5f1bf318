//! tessel-scheduler — evaluation processing for system jobs.
//!
//! Drives one evaluation at a time through the placement pipeline in
//! `tessel-placement` and hands the resulting plan to a [`Planner`].
//!
//! # Architecture
//!
//! ```text
//! SystemScheduler
//!   ├── SnapshotSource (point-in-time cluster state)
//!   ├── tessel-placement (filter → decide → build)
//!   ├── Planner (submit plan, persist evaluations)
//!   └── CancelToken (checked between phases)
//! ```
//!
//! [`Harness`] is a `Planner` and `SnapshotSource` over an embedded
//! [`StateStore`](tessel_state::StateStore), used by tests and the
//! simulator.

pub mod cancel;
pub mod config;
pub mod error;
pub mod harness;
pub mod planner;
pub mod scheduler;
pub mod system;

pub use cancel::CancelToken;
pub use config::{BlockedEvalPolicy, ConflictPolicy, SchedulerConfig};
pub use error::{PlanError, SchedulerError, SchedulerResult};
pub use harness::Harness;
pub use planner::Planner;
pub use scheduler::{EvalOutcome, Scheduler, new_scheduler};
pub use system::SystemScheduler;
