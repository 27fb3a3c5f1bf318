//! Concurrent evaluation runner.
//!
//! Registers one `job-register` evaluation per system job in the fixture
//! and processes them concurrently, one blocking task per evaluation. The
//! evaluations share a single store, so plans for jobs drawing on the same
//! quota can conflict at commit time; the scheduler's conflict policy
//! decides whether they retry.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use tessel_placement::derive_id;
use tessel_scheduler::{CancelToken, EvalOutcome, Harness, new_scheduler};
use tessel_state::{Evaluation, JobType, StateStore, triggers};

use crate::fixture::ClusterFixture;

/// Seed `store` from `fixture`, drain `drains`, and evaluate every system job.
///
/// Outcomes are returned in job order.
pub async fn run_fixture(
    fixture: &ClusterFixture,
    store: StateStore,
    drains: &[String],
) -> anyhow::Result<Vec<EvalOutcome>> {
    fixture.seed(&store)?;
    for node_id in drains {
        store.update_node_drain(node_id, true)?;
    }

    for job in fixture.jobs.iter().filter(|j| j.job_type != JobType::System) {
        warn!(job = %job.id, job_type = %job.job_type, "skipping non-system job");
    }

    let harness = Arc::new(Harness::new(store));
    let cancel = CancelToken::new();
    let mut tasks = JoinSet::new();

    for (position, job) in fixture.system_jobs().enumerate() {
        let eval_id = derive_id(&["sim", job.namespace.as_str(), job.id.as_str()]);
        let eval = Evaluation::for_job(&eval_id, job, triggers::JOB_REGISTER);
        harness.store().put_evals(std::slice::from_ref(&eval))?;

        let mut scheduler = new_scheduler(
            job.job_type,
            fixture.scheduler.clone(),
            harness.clone(),
            harness.clone(),
            cancel.clone(),
        )?;
        tasks.spawn_blocking(move || (position, scheduler.process(&eval)));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(joined?);
    }
    outcomes.sort_by_key(|(position, _)| *position);

    let outcomes: Vec<EvalOutcome> = outcomes.into_iter().map(|(_, outcome)| outcome).collect();
    info!(
        evaluations = outcomes.len(),
        plans = outcomes.iter().map(|o| o.plans.len()).sum::<usize>(),
        "fixture run finished"
    );
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_state::EvalStatus;

    const SAMPLE: &str = include_str!("../fixtures/quota.toml");

    #[tokio::test]
    async fn runs_sample_fixture() {
        let fixture = ClusterFixture::from_toml_str(SAMPLE).unwrap();
        let store = StateStore::open_in_memory().unwrap();

        let outcomes = run_fixture(&fixture, store.clone(), &[]).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.eval.status == EvalStatus::Complete));

        let agent = &outcomes[0];
        assert_eq!(agent.eval.job_id, "agent");
        assert_eq!(agent.placements(), 4);
        assert!(agent.blocked_eval.is_some());

        let shipper = &outcomes[1];
        assert_eq!(shipper.placements(), 10);
        assert!(shipper.blocked_eval.is_none());

        assert_eq!(store.list_allocs_by_job("prod", "agent", false).unwrap().len(), 4);
        assert_eq!(
            store.list_allocs_by_job("default", "log-shipper", false).unwrap().len(),
            10
        );
    }

    #[tokio::test]
    async fn drained_nodes_receive_nothing() {
        let fixture = ClusterFixture::from_toml_str(SAMPLE).unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let drains = vec!["node-01".to_string(), "node-02".to_string()];

        let outcomes = run_fixture(&fixture, store.clone(), &drains).await.unwrap();

        assert_eq!(outcomes[1].placements(), 8);
        assert!(store.list_allocs_by_node("node-01", false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_drain_target_is_an_error() {
        let fixture = ClusterFixture::from_toml_str(SAMPLE).unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let result = run_fixture(&fixture, store, &["node-99".to_string()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessel.redb");
        let fixture = ClusterFixture::from_toml_str(SAMPLE).unwrap();

        run_fixture(&fixture, StateStore::open(&path).unwrap(), &[]).await.unwrap();

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.list_evals().unwrap().len(), 3);
    }
}
