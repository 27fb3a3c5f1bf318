//! Scheduler trait and factory.
//!
//! Every job type is driven through the same [`Scheduler`] interface. Only
//! system jobs have an implementation; asking the factory for any other
//! type is an error rather than a silent fallback.

use std::sync::Arc;

use serde::Serialize;

use tessel_placement::FailureTally;
use tessel_state::{Evaluation, JobType, Plan, SnapshotSource};

use crate::cancel::CancelToken;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::planner::Planner;
use crate::system::SystemScheduler;

/// Everything one evaluation produced.
#[derive(Debug, Clone, Serialize)]
pub struct EvalOutcome {
    /// The evaluation in its final state.
    pub eval: Evaluation,
    /// Plans submitted, in submission order.
    pub plans: Vec<Plan>,
    /// Placement failures of the last pipeline run.
    pub failures: FailureTally,
    /// Follow-up evaluation created for unplaced instances.
    pub blocked_eval: Option<Evaluation>,
    /// Why the evaluation could not be processed or persisted, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvalOutcome {
    pub fn new(eval: Evaluation) -> Self {
        Self {
            eval,
            plans: Vec::new(),
            failures: FailureTally::default(),
            blocked_eval: None,
            error: None,
        }
    }

    /// Placements in the last submitted plan.
    pub fn placements(&self) -> usize {
        self.plans.last().map(|p| p.placements().count()).unwrap_or(0)
    }
}

/// Processes evaluations to a terminal state.
pub trait Scheduler: Send {
    fn process(&mut self, eval: &Evaluation) -> EvalOutcome;
}

/// Build the scheduler for `job_type`.
pub fn new_scheduler(
    job_type: JobType,
    config: SchedulerConfig,
    source: Arc<dyn SnapshotSource>,
    planner: Arc<dyn Planner>,
    cancel: CancelToken,
) -> SchedulerResult<Box<dyn Scheduler>> {
    match job_type {
        JobType::System => Ok(Box::new(SystemScheduler::new(config, source, planner, cancel))),
        other => Err(SchedulerError::UnsupportedJobType(other)),
    }
}
