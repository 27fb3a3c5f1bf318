//! The scheduler's outbound interface.

use tessel_state::{Evaluation, Plan, PlanOutcome};

use crate::error::{PlanError, SchedulerResult};

/// Applies plans and persists evaluations on behalf of a scheduler.
///
/// Implementations must re-validate a plan against current state before
/// applying it, and report a stale plan as [`PlanOutcome::Conflict`]
/// without applying any part of it.
pub trait Planner: Send + Sync {
    /// Submit a plan for atomic application.
    fn submit_plan(&self, plan: &Plan) -> Result<PlanOutcome, PlanError>;

    /// Persist the evaluation's final state.
    fn update_eval(&self, eval: &Evaluation) -> SchedulerResult<()>;

    /// Persist a follow-up evaluation.
    fn create_eval(&self, eval: &Evaluation) -> SchedulerResult<()>;
}
