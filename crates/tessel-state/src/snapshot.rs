//! Point-in-time, read-only view of cluster state.
//!
//! A `StateSnapshot` is what one evaluation reads from. It is built from a
//! single redb read transaction (see [`StateStore::snapshot`]) so every
//! table reflects the same store index. All maps are `BTreeMap`s, which
//! makes iteration order, and with it scheduling order, deterministic.
//!
//! [`StateStore::snapshot`]: crate::StateStore::snapshot

use std::collections::BTreeMap;

use crate::error::StateResult;
use crate::types::*;

/// Anything that can hand out consistent snapshots.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> StateResult<StateSnapshot>;
}

/// An immutable copy of cluster state at one store index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    index: u64,
    nodes: BTreeMap<NodeId, Node>,
    /// Keyed by `{namespace}/{job_id}`.
    jobs: BTreeMap<String, Job>,
    /// Keyed by `{namespace}/{job_id}/{alloc_id}`.
    allocs: BTreeMap<String, Allocation>,
    namespaces: BTreeMap<String, Namespace>,
    quotas: BTreeMap<String, QuotaSpec>,
    evals: BTreeMap<EvalId, Evaluation>,
}

impl StateSnapshot {
    /// An empty snapshot at `index`.
    pub fn at_index(index: u64) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Store index the snapshot was taken at.
    pub fn index(&self) -> u64 {
        self.index
    }

    // ── Population ────────────────────────────────────────────────

    pub fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn upsert_job(&mut self, job: Job) {
        self.jobs.insert(job.table_key(), job);
    }

    pub fn upsert_alloc(&mut self, alloc: Allocation) {
        self.allocs.insert(alloc.table_key(), alloc);
    }

    pub fn upsert_namespace(&mut self, namespace: Namespace) {
        self.namespaces.insert(namespace.name.clone(), namespace);
    }

    pub fn upsert_quota_spec(&mut self, spec: QuotaSpec) {
        self.quotas.insert(spec.name.clone(), spec);
    }

    pub fn upsert_eval(&mut self, eval: Evaluation) {
        self.evals.insert(eval.id.clone(), eval);
    }

    // ── Lookups ───────────────────────────────────────────────────

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// All nodes in node ID order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn job(&self, namespace: &str, job_id: &str) -> Option<&Job> {
        self.jobs.get(&job_key(namespace, job_id))
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    pub fn quota_spec(&self, name: &str) -> Option<&QuotaSpec> {
        self.quotas.get(name)
    }

    pub fn quota_specs(&self) -> impl Iterator<Item = &QuotaSpec> {
        self.quotas.values()
    }

    /// Name of the quota a namespace is bound to, if any.
    pub fn quota_for_namespace(&self, namespace: &str) -> Option<&str> {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.quota.as_deref())
    }

    pub fn eval(&self, eval_id: &str) -> Option<&Evaluation> {
        self.evals.get(eval_id)
    }

    pub fn allocs(&self) -> impl Iterator<Item = &Allocation> {
        self.allocs.values()
    }

    /// Allocations of one job, in allocation ID order.
    ///
    /// Job IDs may contain `/`, so the key prefix of `agent` also covers
    /// `agent/periodic-1`. Matches are checked against the record fields.
    pub fn allocs_by_job(
        &self,
        namespace: &str,
        job_id: &str,
        include_terminal: bool,
    ) -> Vec<&Allocation> {
        let prefix = format!("{}/", job_key(namespace, job_id));
        self.allocs
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, alloc)| alloc)
            .filter(|alloc| alloc.namespace == namespace && alloc.job_id == job_id)
            .filter(|alloc| include_terminal || !alloc.is_terminal())
            .collect()
    }

    /// Allocations placed on one node, across all jobs.
    pub fn allocs_by_node(&self, node_id: &str, include_terminal: bool) -> Vec<&Allocation> {
        self.allocs
            .values()
            .filter(|alloc| alloc.node_id == node_id)
            .filter(|alloc| include_terminal || !alloc.is_terminal())
            .collect()
    }

    /// Allocations of every job in a namespace.
    pub fn allocs_by_namespace(&self, namespace: &str, include_terminal: bool) -> Vec<&Allocation> {
        let prefix = format!("{namespace}/");
        self.allocs
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, alloc)| alloc)
            .filter(|alloc| alloc.namespace == namespace)
            .filter(|alloc| include_terminal || !alloc.is_terminal())
            .collect()
    }
}

impl SnapshotSource for StateSnapshot {
    fn snapshot(&self) -> StateResult<StateSnapshot> {
        Ok(self.clone())
    }
}
