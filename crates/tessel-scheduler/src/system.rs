//! System scheduler: the evaluation driver for system jobs.
//!
//! One call to [`SystemScheduler::process`] takes a pending evaluation to
//! a terminal status:
//!
//! ```text
//! snapshot ─► filter ─► decide (quota) ─► build ─► submit ─► finalize
//!    ▲                                               │
//!    └──────────── conflict, policy = refresh ───────┘
//! ```
//!
//! The cancel token is checked between phases. Nothing is submitted once
//! cancellation is observed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tessel_placement::{QuotaAccountant, build_plan, decide, derive_id, filter_job};
use tessel_state::{EvalStatus, Evaluation, PlanOutcome, SnapshotSource, StateError, triggers};

use crate::cancel::CancelToken;
use crate::config::{BlockedEvalPolicy, ConflictPolicy, SchedulerConfig};
use crate::planner::Planner;
use crate::scheduler::{EvalOutcome, Scheduler};

/// Evaluation triggers the system scheduler acts on.
const HANDLED_TRIGGERS: &[&str] = &[
    triggers::JOB_REGISTER,
    triggers::JOB_DEREGISTER,
    triggers::NODE_UPDATE,
    triggers::NODE_DRAIN,
    triggers::ALLOC_STOP,
    triggers::QUEUED_ALLOCS,
    triggers::ROLLING_UPDATE,
    triggers::PERIODIC_JOB,
    triggers::MAX_PLAN_ATTEMPTS,
    triggers::FAILED_FOLLOW_UP,
    triggers::QUOTA_LIMIT,
    triggers::PREEMPTION,
];

/// How one pass of the pipeline ended.
enum Pass {
    Finished(EvalStatus, String),
    Conflict(String),
}

pub struct SystemScheduler {
    config: SchedulerConfig,
    source: Arc<dyn SnapshotSource>,
    planner: Arc<dyn Planner>,
    cancel: CancelToken,
}

impl SystemScheduler {
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn SnapshotSource>,
        planner: Arc<dyn Planner>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            source,
            planner,
            cancel,
        }
    }

    fn cancelled(&self, eval: &Evaluation, phase: &str) -> Option<Pass> {
        if self.cancel.is_cancelled() {
            info!(eval_id = %eval.id, phase, "evaluation cancelled");
            Some(Pass::Finished(
                EvalStatus::Cancelled,
                format!("evaluation cancelled {phase}"),
            ))
        } else {
            None
        }
    }

    /// Run snapshot → submit once.
    fn run_pass(&self, eval: &Evaluation, outcome: &mut EvalOutcome) -> Pass {
        if let Some(pass) = self.cancelled(eval, "before reading state") {
            return pass;
        }

        let snapshot = match self.source.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(eval_id = %eval.id, error = %e, "failed to read state snapshot");
                return Pass::Finished(
                    EvalStatus::Failed,
                    format!("failed to read state snapshot: {e}"),
                );
            }
        };
        let job = snapshot.job(&eval.namespace, &eval.job_id);
        let region = job
            .map(|j| j.region.as_str())
            .filter(|r| !r.is_empty())
            .unwrap_or(self.config.region.as_str());

        let candidates = job.map(|j| filter_job(&snapshot, j)).unwrap_or_default();
        if let Some(pass) = self.cancelled(eval, "after filtering nodes") {
            return pass;
        }

        let mut accountant = QuotaAccountant::from_snapshot(&snapshot, region);
        let decisions = decide(
            &snapshot,
            &eval.namespace,
            &eval.job_id,
            job,
            &candidates,
            &mut accountant,
        );
        outcome.failures = decisions.failures.clone();
        if let Some(pass) = self.cancelled(eval, "after placement decisions") {
            return pass;
        }

        let plan = match build_plan(eval, job, region, &decisions) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(eval_id = %eval.id, error = %e, "failed to build plan");
                return Pass::Finished(EvalStatus::Failed, format!("failed to build plan: {e}"));
            }
        };
        if let Some(pass) = self.cancelled(eval, "before submitting plan") {
            return pass;
        }

        if plan.is_no_op() {
            debug!(eval_id = %eval.id, job = %eval.job_id, "nothing to place or stop");
            return Pass::Finished(EvalStatus::Complete, String::new());
        }

        info!(
            eval_id = %eval.id,
            job = %eval.job_id,
            namespace = %eval.namespace,
            snapshot_index = snapshot.index(),
            placements = decisions.placements.len(),
            evictions = decisions.evictions.len(),
            "submitting plan"
        );
        outcome.plans.push(plan.clone());
        match self.planner.submit_plan(&plan) {
            Ok(PlanOutcome::Applied(result)) => {
                debug!(eval_id = %eval.id, alloc_index = result.alloc_index, "plan applied");
                Pass::Finished(EvalStatus::Complete, String::new())
            }
            Ok(PlanOutcome::Conflict(reason)) => Pass::Conflict(reason),
            Err(e) => {
                warn!(eval_id = %eval.id, error = %e, "plan rejected");
                Pass::Finished(EvalStatus::Failed, format!("plan submission failed: {e}"))
            }
        }
    }

    /// Move the eval to its terminal status, attach the tally, create a
    /// blocked follow-up if configured, and persist.
    fn finalize(&self, outcome: &mut EvalOutcome, status: EvalStatus, description: String) {
        if let Err(e) = outcome.eval.transition(status, &description) {
            warn!(eval_id = %outcome.eval.id, error = %e, "refusing evaluation transition");
            outcome.error = Some(e.to_string());
            return;
        }

        if status == EvalStatus::Complete {
            outcome.eval.failed_tg_allocs = outcome.failures.failed_groups();
            outcome.eval.queued_allocations = outcome.failures.queued();
            outcome.eval.quota_limit_reached =
                outcome.failures.quota_limit_reached().map(str::to_string);

            if outcome.failures.has_placement_failures() {
                warn!(
                    eval_id = %outcome.eval.id,
                    job = %outcome.eval.job_id,
                    unplaced = outcome.failures.placement_failures(),
                    quota = outcome.eval.quota_limit_reached.as_deref().unwrap_or(""),
                    "evaluation completed with unplaced allocations"
                );
                if self.config.blocked_evals == BlockedEvalPolicy::Create {
                    self.create_blocked_eval(outcome);
                }
            }
        }

        if let Err(e) = self.planner.update_eval(&outcome.eval) {
            warn!(eval_id = %outcome.eval.id, error = %e, "failed to persist evaluation");
            outcome.error = Some(e.to_string());
        }
        info!(
            eval_id = %outcome.eval.id,
            job = %outcome.eval.job_id,
            status = %outcome.eval.status,
            plans = outcome.plans.len(),
            "evaluation finished"
        );
    }

    fn create_blocked_eval(&self, outcome: &mut EvalOutcome) {
        let parent = &outcome.eval;
        let blocked = Evaluation {
            id: derive_id(&["blocked", parent.id.as_str()]),
            namespace: parent.namespace.clone(),
            priority: parent.priority,
            job_type: parent.job_type,
            triggered_by: triggers::QUEUED_ALLOCS.to_string(),
            job_id: parent.job_id.clone(),
            node_id: None,
            status: EvalStatus::Blocked,
            status_description: "created to place remaining allocations".to_string(),
            previous_eval: Some(parent.id.clone()),
            blocked_eval: None,
            failed_tg_allocs: Default::default(),
            queued_allocations: parent.queued_allocations.clone(),
            quota_limit_reached: parent.quota_limit_reached.clone(),
            create_index: 0,
            modify_index: 0,
        };

        match self.planner.create_eval(&blocked) {
            Ok(()) => {
                info!(eval_id = %parent.id, blocked_eval = %blocked.id, "created blocked evaluation");
                outcome.eval.blocked_eval = Some(blocked.id.clone());
                outcome.blocked_eval = Some(blocked);
            }
            Err(e) => {
                warn!(eval_id = %parent.id, error = %e, "failed to create blocked evaluation");
            }
        }
    }
}

impl Scheduler for SystemScheduler {
    fn process(&mut self, eval: &Evaluation) -> EvalOutcome {
        let mut outcome = EvalOutcome::new(eval.clone());

        if eval.status != EvalStatus::Pending {
            let err = StateError::InvalidTransition {
                from: eval.status,
                to: EvalStatus::Complete,
            };
            warn!(eval_id = %eval.id, status = %eval.status, "refusing to process non-pending evaluation");
            outcome.error = Some(err.to_string());
            return outcome;
        }

        if !HANDLED_TRIGGERS.contains(&eval.triggered_by.as_str()) {
            warn!(eval_id = %eval.id, trigger = %eval.triggered_by, "unhandled evaluation trigger");
            let description = format!(
                "scheduler cannot handle '{}' evaluation reason",
                eval.triggered_by
            );
            self.finalize(&mut outcome, EvalStatus::Failed, description);
            return outcome;
        }

        info!(
            eval_id = %eval.id,
            job = %eval.job_id,
            namespace = %eval.namespace,
            trigger = %eval.triggered_by,
            "processing evaluation"
        );

        let max_attempts = self.config.max_attempts();
        let mut attempts = 0;
        let (status, description) = loop {
            attempts += 1;
            match self.run_pass(eval, &mut outcome) {
                Pass::Finished(status, description) => break (status, description),
                Pass::Conflict(reason) => {
                    warn!(eval_id = %eval.id, attempt = attempts, %reason, "plan conflict");
                    match self.config.plan_conflict {
                        ConflictPolicy::Fail => {
                            break (EvalStatus::Failed, format!("plan conflict: {reason}"));
                        }
                        ConflictPolicy::Refresh if attempts >= max_attempts => {
                            break (
                                EvalStatus::Failed,
                                format!("maximum attempts reached ({max_attempts})"),
                            );
                        }
                        ConflictPolicy::Refresh => {
                            debug!(eval_id = %eval.id, attempt = attempts, "refreshing state and retrying");
                        }
                    }
                }
            }
        };

        self.finalize(&mut outcome, status, description);
        outcome
    }
}
