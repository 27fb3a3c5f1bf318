//! Placement decider.
//!
//! Reconciles a system job's desired state (one instance of every task
//! group per eligible node) against its existing allocations. Evictions are
//! decided first so the capacity and quota they free is visible to the
//! placements that follow.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use tessel_state::{AllocStatus, Allocation, Job, NodeId, Resources, StateSnapshot};

use crate::feasible::GroupCandidates;
use crate::metrics::FailureTally;
use crate::quota::{Admission, QuotaAccountant};

/// A new instance of a task group on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub node_id: NodeId,
    pub task_group: String,
    pub resources: Resources,
}

/// An existing allocation to stop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Eviction {
    pub alloc: Allocation,
    pub status: AllocStatus,
    pub description: String,
}

impl Eviction {
    fn new(alloc: &Allocation, status: AllocStatus, description: impl Into<String>) -> Self {
        Self {
            alloc: alloc.clone(),
            status,
            description: description.into(),
        }
    }
}

/// Everything the decider concluded for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Decisions {
    pub placements: Vec<Placement>,
    pub evictions: Vec<Eviction>,
    pub failures: FailureTally,
}

impl Decisions {
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.evictions.is_empty()
    }
}

/// Decide placements and evictions for one job.
///
/// `job` is `None` when the job is no longer registered; all of its
/// allocations are then evicted. `candidates` must come from filtering the
/// same snapshot.
pub fn decide(
    snapshot: &StateSnapshot,
    namespace: &str,
    job_id: &str,
    job: Option<&Job>,
    candidates: &[GroupCandidates<'_>],
    accountant: &mut QuotaAccountant,
) -> Decisions {
    let mut decisions = Decisions::default();
    let existing = snapshot.allocs_by_job(namespace, job_id, false);

    let job = match job {
        Some(job) if !job.stop => job,
        stopped => {
            let description = if stopped.is_some() {
                "alloc not needed since job is stopped"
            } else {
                "alloc not needed since job was deregistered"
            };
            for alloc in existing {
                debug!(job = %job_id, alloc = %alloc.id, node = %alloc.node_id, "evicting allocation of stopped job");
                accountant.release(namespace, &alloc.resources);
                decisions
                    .evictions
                    .push(Eviction::new(alloc, AllocStatus::Evicted, description));
            }
            return decisions;
        }
    };

    // ── Evictions ─────────────────────────────────────────────────

    // Allocation IDs ascend within each job, so the first entry per
    // (group, node) is the one kept.
    let mut by_slot: BTreeMap<(&str, &str), Vec<&Allocation>> = BTreeMap::new();
    for alloc in existing.iter().copied() {
        by_slot
            .entry((alloc.task_group.as_str(), alloc.node_id.as_str()))
            .or_default()
            .push(alloc);
    }

    let mut satisfied: HashSet<(&str, &str)> = HashSet::new();
    for ((group, node_id), allocs) in &by_slot {
        let group_candidates = match candidates.iter().find(|c| c.group.name == *group) {
            Some(c) if job.lookup_task_group(group).is_some() => c,
            _ => {
                for alloc in allocs {
                    debug!(job = %job_id, task_group = %group, alloc = %alloc.id, "evicting allocation of removed task group");
                    decisions.evictions.push(Eviction::new(
                        alloc,
                        AllocStatus::Evicted,
                        "alloc not needed since task group was removed from job",
                    ));
                }
                continue;
            }
        };

        let Some((kept, duplicates)) = allocs.split_first() else {
            continue;
        };
        for alloc in duplicates {
            debug!(job = %job_id, task_group = %group, node = %node_id, alloc = %alloc.id, "evicting duplicate allocation");
            decisions.evictions.push(Eviction::new(
                alloc,
                AllocStatus::Evicted,
                "alloc not needed since it duplicates another allocation on this node",
            ));
        }

        if let Some(reason) = group_candidates.excluded.get(*node_id) {
            debug!(job = %job_id, task_group = %group, node = %node_id, %reason, "evicting allocation from excluded node");
            decisions.evictions.push(Eviction::new(
                kept,
                reason.eviction_status(),
                reason.eviction_description(),
            ));
        } else if group_candidates.is_eligible(node_id) {
            satisfied.insert((*group, *node_id));
        } else {
            debug!(job = %job_id, node = %node_id, alloc = %kept.id, "evicting allocation from unknown node");
            decisions.evictions.push(Eviction::new(
                kept,
                AllocStatus::Lost,
                "alloc is lost since its node no longer exists",
            ));
        }
    }

    for eviction in &decisions.evictions {
        accountant.release(namespace, &eviction.alloc.resources);
    }
    let evicted: HashSet<&str> = decisions
        .evictions
        .iter()
        .map(|e| e.alloc.id.as_str())
        .collect();

    // ── Placements ────────────────────────────────────────────────

    let mut node_usage: HashMap<&str, Resources> = HashMap::new();
    let mut placements = Vec::new();
    let mut failures = FailureTally::new();

    for group_candidates in candidates {
        let group = group_candidates.group;
        failures.record_evaluated(group_candidates);

        for node in &group_candidates.eligible {
            if satisfied.contains(&(group.name.as_str(), node.id.as_str())) {
                continue;
            }

            let used = node_usage.entry(node.id.as_str()).or_insert_with(|| {
                let mut used = Resources::default();
                for alloc in snapshot.allocs_by_node(&node.id, false) {
                    if !evicted.contains(alloc.id.as_str()) {
                        used.add(&alloc.resources);
                    }
                }
                used
            });
            if let Some(dim) = used.plus(&group.resources).exceeds(&node.allocatable()) {
                debug!(job = %job_id, task_group = %group.name, node = %node.id, dimension = %dim, "node exhausted");
                failures.record_exhausted(&group.name, dim);
                continue;
            }

            match accountant.try_reserve(namespace, &group.resources) {
                Admission::Admitted => {
                    debug!(job = %job_id, task_group = %group.name, node = %node.id, "placement admitted");
                    used.add(&group.resources);
                    placements.push(Placement {
                        node_id: node.id.clone(),
                        task_group: group.name.clone(),
                        resources: group.resources,
                    });
                }
                Admission::Rejected(rejection) => {
                    debug!(
                        job = %job_id,
                        task_group = %group.name,
                        node = %node.id,
                        quota = %rejection.quota,
                        dimension = rejection.dimension_label(),
                        "placement rejected by quota"
                    );
                    failures.record_quota(&group.name, &rejection);
                }
            }
        }
    }

    decisions.placements = placements;
    decisions.failures = failures;
    decisions
}
