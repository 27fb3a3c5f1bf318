//! Tessel placement: the pure core of system-job scheduling.
//!
//! Given a [`StateSnapshot`](tessel_state::StateSnapshot) and a job, this
//! crate decides where one instance of each task group should run and what
//! must be stopped. It performs no I/O; the evaluation driver in
//! `tessel-scheduler` feeds it snapshots and submits the plans it builds.
//!
//! # Components
//!
//! - **`constraint`** — Constraint operands and `${...}` target interpolation
//! - **`feasible`** — Node eligibility filter
//! - **`quota`** — Per-evaluation quota accountant
//! - **`decider`** — Placement and eviction decisions
//! - **`metrics`** — Failure tally attached to the evaluation
//! - **`plan`** — Plan builder and deterministic allocation IDs

pub mod constraint;
pub mod decider;
pub mod error;
pub mod feasible;
pub mod metrics;
pub mod plan;
pub mod quota;

pub use constraint::{check_constraint, resolve_target};
pub use decider::{Decisions, Eviction, Placement, decide};
pub use error::{PlanBuildError, PlanBuildResult};
pub use feasible::{ExclusionReason, GroupCandidates, check_node, filter_job, filter_nodes};
pub use metrics::{FailureReason, FailureTally};
pub use plan::{PlanBuilder, build_plan, derive_id};
pub use quota::{Admission, QuotaAccountant, QuotaRejection};
