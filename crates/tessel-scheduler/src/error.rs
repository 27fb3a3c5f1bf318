//! Scheduler error types.

use thiserror::Error;

use tessel_placement::PlanBuildError;
use tessel_state::{JobType, StateError};

/// Errors that can occur while constructing or running a scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no scheduler for job type {0}")]
    UnsupportedJobType(JobType),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("plan build error: {0}")]
    PlanBuild(#[from] PlanBuildError),

    #[error("plan rejected: {0}")]
    PlanRejected(String),

    #[error("invalid scheduler config: {0}")]
    Config(String),

    #[error("evaluation sink error: {0}")]
    EvalSink(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors returned by a [`Planner`](crate::Planner) when applying a plan.
///
/// A commit-time conflict is not an error; it is reported as
/// [`PlanOutcome::Conflict`](tessel_state::PlanOutcome::Conflict).
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan rejected: {0}")]
    Rejected(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl From<PlanError> for SchedulerError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Rejected(reason) => SchedulerError::PlanRejected(reason),
            PlanError::State(e) => SchedulerError::State(e),
        }
    }
}
