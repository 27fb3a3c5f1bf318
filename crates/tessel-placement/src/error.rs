//! Plan builder error types.

use thiserror::Error;

/// Errors that can occur while assembling a plan from decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanBuildError {
    #[error("node {node_id} is both a placement and an eviction target for task group {task_group}")]
    Conflict { node_id: String, task_group: String },

    #[error("task group {task_group} placed twice on node {node_id}")]
    DuplicatePlacement { node_id: String, task_group: String },

    #[error("cannot place allocations for job {0}: job is not registered")]
    MissingJob(String),
}

pub type PlanBuildResult<T> = Result<T, PlanBuildError>;
