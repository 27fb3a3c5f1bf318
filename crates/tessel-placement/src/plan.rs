//! Plan builder.
//!
//! Turns the decider's placements and evictions into a [`Plan`]. Each
//! affected node gets one entry, with allocations sorted by ID, so the same
//! decisions always serialize to the same plan.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use tessel_state::{AllocStatus, Allocation, Evaluation, Job, NodeId, Plan};

use crate::decider::{Decisions, Eviction, Placement};
use crate::error::{PlanBuildError, PlanBuildResult};

/// Derive a stable, UUID-shaped identifier from `parts`.
pub fn derive_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let hex = hex::encode(hasher.finalize());
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Accumulates decisions for one evaluation.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    eval_id: String,
    namespace: String,
    job_id: String,
    priority: u32,
    region: String,
    job: Option<Job>,
    node_update: BTreeMap<NodeId, Vec<Allocation>>,
    node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
}

impl PlanBuilder {
    /// `region` is the region quota was accounted in for this evaluation.
    pub fn new(eval: &Evaluation, job: Option<&Job>, region: &str) -> Self {
        Self {
            eval_id: eval.id.clone(),
            namespace: eval.namespace.clone(),
            job_id: eval.job_id.clone(),
            priority: job.map(|j| j.priority).unwrap_or(eval.priority),
            region: region.to_string(),
            job: job.cloned(),
            node_update: BTreeMap::new(),
            node_allocation: BTreeMap::new(),
        }
    }

    pub fn append_eviction(&mut self, eviction: &Eviction) -> PlanBuildResult<()> {
        let alloc = &eviction.alloc;
        if has_group(&self.node_allocation, &alloc.node_id, &alloc.task_group) {
            return Err(PlanBuildError::Conflict {
                node_id: alloc.node_id.clone(),
                task_group: alloc.task_group.clone(),
            });
        }
        let entry = self.node_update.entry(alloc.node_id.clone()).or_default();
        if entry.iter().any(|a| a.id == alloc.id) {
            return Ok(());
        }
        let mut stopped = alloc.clone();
        stopped.status = eviction.status;
        stopped.status_description = eviction.description.clone();
        entry.push(stopped);
        Ok(())
    }

    pub fn append_placement(&mut self, placement: &Placement) -> PlanBuildResult<()> {
        let Some(job) = &self.job else {
            return Err(PlanBuildError::MissingJob(self.job_id.clone()));
        };
        let node_id = &placement.node_id;
        let group = &placement.task_group;
        if has_group(&self.node_update, node_id, group) {
            return Err(PlanBuildError::Conflict {
                node_id: node_id.clone(),
                task_group: group.clone(),
            });
        }
        if has_group(&self.node_allocation, node_id, group) {
            return Err(PlanBuildError::DuplicatePlacement {
                node_id: node_id.clone(),
                task_group: group.clone(),
            });
        }

        let alloc = Allocation {
            id: derive_id(&[
                self.eval_id.as_str(),
                self.namespace.as_str(),
                self.job_id.as_str(),
                group.as_str(),
                node_id.as_str(),
            ]),
            eval_id: self.eval_id.clone(),
            name: format!("{}.{}[0]", job.id, group),
            namespace: self.namespace.clone(),
            job_id: self.job_id.clone(),
            task_group: group.clone(),
            node_id: node_id.clone(),
            resources: placement.resources,
            status: AllocStatus::Pending,
            status_description: String::new(),
            create_index: 0,
            modify_index: 0,
        };
        self.node_allocation
            .entry(node_id.clone())
            .or_default()
            .push(alloc);
        Ok(())
    }

    pub fn build(mut self) -> Plan {
        for allocs in self
            .node_update
            .values_mut()
            .chain(self.node_allocation.values_mut())
        {
            allocs.sort_by(|a, b| a.id.cmp(&b.id));
        }
        Plan {
            eval_id: self.eval_id,
            namespace: self.namespace,
            job_id: self.job_id,
            priority: self.priority,
            region: self.region,
            job: self.job,
            node_update: self.node_update,
            node_allocation: self.node_allocation,
        }
    }
}

fn has_group(entries: &BTreeMap<NodeId, Vec<Allocation>>, node_id: &str, group: &str) -> bool {
    entries
        .get(node_id)
        .is_some_and(|allocs| allocs.iter().any(|a| a.task_group == group))
}

/// Build the plan for `eval` from the decider's output.
pub fn build_plan(
    eval: &Evaluation,
    job: Option<&Job>,
    region: &str,
    decisions: &Decisions,
) -> PlanBuildResult<Plan> {
    let mut builder = PlanBuilder::new(eval, job, region);
    for eviction in &decisions.evictions {
        builder.append_eviction(eviction)?;
    }
    for placement in &decisions.placements {
        builder.append_placement(placement)?;
    }
    Ok(builder.build())
}
