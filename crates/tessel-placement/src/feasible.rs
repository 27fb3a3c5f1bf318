//! Node eligibility filter.
//!
//! Reduces the cluster's node set to the nodes a task group may run on:
//! ready, not draining, eligible for scheduling, inside one of the job's
//! datacenters, and satisfying every job- and group-level constraint.
//! Output order follows the snapshot's node ID order, so the same
//! snapshot always yields the same candidate list.

use std::collections::BTreeMap;
use std::fmt;

use tessel_state::{
    AllocStatus, Job, Node, NodeId, NodeStatus, SchedulingEligibility, StateSnapshot, TaskGroup,
};

use crate::constraint::check_constraint;

/// Why a node was excluded from placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    Down,
    NotReady,
    Draining,
    Ineligible,
    Datacenter,
    /// The first failing constraint, rendered `<l> <op> <r>`.
    Constraint(String),
}

impl ExclusionReason {
    /// Key used in [`AllocMetric::class_filtered`](tessel_state::AllocMetric).
    pub fn metric_key(&self) -> &'static str {
        match self {
            ExclusionReason::Down => "down",
            ExclusionReason::NotReady => "not_ready",
            ExclusionReason::Draining => "draining",
            ExclusionReason::Ineligible => "ineligible",
            ExclusionReason::Datacenter => "datacenter",
            ExclusionReason::Constraint(_) => "constraint",
        }
    }

    /// Whether the job's own placement rules, rather than node state, excluded the node.
    pub fn is_constraint(&self) -> bool {
        matches!(self, ExclusionReason::Datacenter | ExclusionReason::Constraint(_))
    }

    /// Status given to an existing allocation on a node excluded for this reason.
    pub fn eviction_status(&self) -> AllocStatus {
        match self {
            ExclusionReason::Down => AllocStatus::Lost,
            _ => AllocStatus::Evicted,
        }
    }

    pub fn eviction_description(&self) -> String {
        match self {
            ExclusionReason::Down => "alloc is lost since its node is down".to_string(),
            ExclusionReason::NotReady => "alloc evicted since its node is not ready".to_string(),
            ExclusionReason::Draining => "alloc is being migrated off a draining node".to_string(),
            ExclusionReason::Ineligible => {
                "alloc not needed since node is ineligible for scheduling".to_string()
            }
            ExclusionReason::Datacenter => {
                "alloc not needed since node is outside the job's datacenters".to_string()
            }
            ExclusionReason::Constraint(c) => {
                format!("alloc not needed since node no longer satisfies constraint {c}")
            }
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::Constraint(c) => write!(f, "constraint {c}"),
            other => f.write_str(other.metric_key()),
        }
    }
}

/// Filter result for one task group.
#[derive(Debug, Clone)]
pub struct GroupCandidates<'a> {
    pub group: &'a TaskGroup,
    /// Eligible nodes in node ID order.
    pub eligible: Vec<&'a Node>,
    /// Excluded nodes and why.
    pub excluded: BTreeMap<NodeId, ExclusionReason>,
}

impl GroupCandidates<'_> {
    pub fn is_eligible(&self, node_id: &str) -> bool {
        self.eligible.iter().any(|n| n.id == node_id)
    }

    pub fn nodes_evaluated(&self) -> usize {
        self.eligible.len() + self.excluded.len()
    }
}

/// Decide whether `group` of `job` may run on `node`.
pub fn check_node(node: &Node, job: &Job, group: &TaskGroup) -> Result<(), ExclusionReason> {
    match node.status {
        NodeStatus::Down => return Err(ExclusionReason::Down),
        NodeStatus::Initializing => return Err(ExclusionReason::NotReady),
        NodeStatus::Ready => {}
    }
    if node.drain {
        return Err(ExclusionReason::Draining);
    }
    if node.scheduling_eligibility == SchedulingEligibility::Ineligible {
        return Err(ExclusionReason::Ineligible);
    }
    if !in_datacenters(&node.datacenter, &job.datacenters) {
        return Err(ExclusionReason::Datacenter);
    }
    if let Some(failed) = job
        .constraints
        .iter()
        .chain(group.constraints.iter())
        .find(|c| !check_constraint(c, node))
    {
        return Err(ExclusionReason::Constraint(failed.to_string()));
    }
    Ok(())
}

/// An empty datacenter list places anywhere; `*` is a wildcard suffix.
fn in_datacenters(datacenter: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => datacenter.starts_with(prefix),
        None => pattern == datacenter,
    })
}

/// Split `nodes` into eligible and excluded for one task group.
pub fn filter_nodes<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    job: &Job,
    group: &'a TaskGroup,
) -> GroupCandidates<'a> {
    let mut eligible = Vec::new();
    let mut excluded = BTreeMap::new();
    for node in nodes {
        match check_node(node, job, group) {
            Ok(()) => eligible.push(node),
            Err(reason) => {
                excluded.insert(node.id.clone(), reason);
            }
        }
    }
    GroupCandidates {
        group,
        eligible,
        excluded,
    }
}

/// Filter every task group of `job` against the snapshot's nodes.
pub fn filter_job<'a>(snapshot: &'a StateSnapshot, job: &'a Job) -> Vec<GroupCandidates<'a>> {
    job.task_groups
        .iter()
        .map(|group| filter_nodes(snapshot.nodes(), job, group))
        .collect()
}
