//! In-process planner backed by a [`StateStore`].
//!
//! The harness applies plans through [`StateStore::commit_plan`], persists
//! evaluations to the same store, and records everything it was handed so
//! callers can inspect what a scheduler did. Conflicts and rejections can
//! be injected to exercise the scheduler's failure paths.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use tessel_state::{Evaluation, Plan, PlanOutcome, SnapshotSource, StateResult, StateSnapshot, StateStore};

use crate::error::{PlanError, SchedulerError, SchedulerResult};
use crate::planner::Planner;

#[derive(Debug, Default)]
struct Recorded {
    plans: Vec<Plan>,
    outcomes: Vec<PlanOutcome>,
    evals: Vec<Evaluation>,
    created_evals: Vec<Evaluation>,
}

#[derive(Debug, Default)]
struct Injected {
    conflicts: u32,
    reject: Option<String>,
}

/// Planner and snapshot source over one [`StateStore`].
pub struct Harness {
    store: StateStore,
    recorded: Mutex<Recorded>,
    injected: Mutex<Injected>,
}

/// Recover the guard from a poisoned lock; the recorded data stays usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Harness {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            recorded: Mutex::new(Recorded::default()),
            injected: Mutex::new(Injected::default()),
        }
    }

    /// A harness over a fresh in-memory store.
    pub fn in_memory() -> StateResult<Self> {
        Ok(Self::new(StateStore::open_in_memory()?))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Report the next `n` submitted plans as conflicts without applying them.
    pub fn inject_conflicts(&self, n: u32) {
        lock(&self.injected).conflicts = n;
    }

    /// Reject every subsequently submitted plan with `reason`.
    pub fn reject_plans(&self, reason: &str) {
        lock(&self.injected).reject = Some(reason.to_string());
    }

    /// Plans submitted so far, including conflicting and rejected ones.
    pub fn plans(&self) -> Vec<Plan> {
        lock(&self.recorded).plans.clone()
    }

    pub fn outcomes(&self) -> Vec<PlanOutcome> {
        lock(&self.recorded).outcomes.clone()
    }

    /// Evaluations passed to `update_eval`.
    pub fn evals(&self) -> Vec<Evaluation> {
        lock(&self.recorded).evals.clone()
    }

    /// Evaluations passed to `create_eval`.
    pub fn created_evals(&self) -> Vec<Evaluation> {
        lock(&self.recorded).created_evals.clone()
    }
}

impl SnapshotSource for Harness {
    fn snapshot(&self) -> StateResult<StateSnapshot> {
        self.store.snapshot()
    }
}

impl Planner for Harness {
    fn submit_plan(&self, plan: &Plan) -> Result<PlanOutcome, PlanError> {
        lock(&self.recorded).plans.push(plan.clone());

        let injected = {
            let mut injected = lock(&self.injected);
            if let Some(reason) = &injected.reject {
                Err(reason.clone())
            } else if injected.conflicts > 0 {
                injected.conflicts -= 1;
                Ok(true)
            } else {
                Ok(false)
            }
        };

        let outcome = match injected {
            Err(reason) => {
                warn!(eval_id = %plan.eval_id, %reason, "rejecting plan");
                return Err(PlanError::Rejected(reason));
            }
            Ok(true) => {
                debug!(eval_id = %plan.eval_id, "injecting plan conflict");
                PlanOutcome::Conflict("injected conflict".to_string())
            }
            Ok(false) => self.store.commit_plan(plan)?,
        };

        lock(&self.recorded).outcomes.push(outcome.clone());
        Ok(outcome)
    }

    fn update_eval(&self, eval: &Evaluation) -> SchedulerResult<()> {
        self.store
            .put_evals(std::slice::from_ref(eval))
            .map_err(|e| SchedulerError::EvalSink(e.to_string()))?;
        lock(&self.recorded).evals.push(eval.clone());
        Ok(())
    }

    fn create_eval(&self, eval: &Evaluation) -> SchedulerResult<()> {
        self.store
            .put_evals(std::slice::from_ref(eval))
            .map_err(|e| SchedulerError::EvalSink(e.to_string()))?;
        lock(&self.recorded).created_evals.push(eval.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn empty_plan() -> Plan {
        Plan {
            eval_id: "e1".to_string(),
            namespace: "default".to_string(),
            job_id: "agent".to_string(),
            priority: 50,
            region: "global".to_string(),
            job: None,
            node_update: BTreeMap::new(),
            node_allocation: BTreeMap::new(),
        }
    }

    #[test]
    fn injected_conflicts_are_consumed() {
        let harness = Harness::in_memory().unwrap();
        harness.inject_conflicts(1);

        let first = harness.submit_plan(&empty_plan()).unwrap();
        assert!(matches!(first, PlanOutcome::Conflict(_)));
        let second = harness.submit_plan(&empty_plan()).unwrap();
        assert!(matches!(second, PlanOutcome::Applied(_)));

        assert_eq!(harness.plans().len(), 2);
        assert_eq!(harness.outcomes().len(), 2);
    }

    #[test]
    fn rejection_is_an_error() {
        let harness = Harness::in_memory().unwrap();
        harness.reject_plans("applier unavailable");
        let err = harness.submit_plan(&empty_plan()).unwrap_err();
        assert!(matches!(err, PlanError::Rejected(ref r) if r == "applier unavailable"));
        assert!(harness.outcomes().is_empty());
    }

    #[test]
    fn evals_are_persisted_and_recorded() {
        let harness = Harness::in_memory().unwrap();
        let job = tessel_state::Job {
            id: "agent".to_string(),
            namespace: "default".to_string(),
            region: "global".to_string(),
            datacenters: Vec::new(),
            job_type: tessel_state::JobType::System,
            priority: 50,
            stop: false,
            version: 0,
            constraints: Vec::new(),
            task_groups: Vec::new(),
            create_index: 0,
            modify_index: 0,
        };
        let eval = Evaluation::for_job("e1", &job, tessel_state::triggers::JOB_REGISTER);
        harness.update_eval(&eval).unwrap();
        harness.create_eval(&eval).unwrap();

        assert!(harness.store().get_eval("e1").unwrap().is_some());
        assert_eq!(harness.evals().len(), 1);
        assert_eq!(harness.created_evals().len(), 1);
    }
}
