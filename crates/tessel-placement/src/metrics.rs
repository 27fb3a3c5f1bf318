//! Per-evaluation placement failure tally.
//!
//! Every node the decider looks at leaves a trace here: filtered nodes,
//! exhausted nodes, and quota rejections, grouped by task group in the
//! [`AllocMetric`] shape that ends up on the evaluation.

use std::collections::BTreeMap;

use serde::Serialize;

use tessel_state::{AllocMetric, Dimension};

use crate::feasible::{ExclusionReason, GroupCandidates};
use crate::quota::QuotaRejection;

/// Reasons a node did not receive a task group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A namespace quota refused the placement.
    QuotaExhausted,
    /// The node had no room left.
    ResourcesExhausted,
    /// A job or group constraint excluded the node.
    ConstraintFiltered,
}

impl FailureReason {
    /// Whether the reason leaves a wanted instance unplaced. A node excluded
    /// by constraints was never meant to run the group.
    pub fn is_placement_failure(self) -> bool {
        !matches!(self, FailureReason::ConstraintFiltered)
    }
}

/// Per-evaluation tally of why nodes did not receive a task group.
///
/// Constraint exclusions are counted under
/// [`FailureReason::ConstraintFiltered`] and in the group metric's
/// `class_filtered`/`constraint_filtered` maps, but they are not placement
/// failures: a job whose constraints exclude every node reports
/// `has_placement_failures() == false` and queues nothing. Other filter
/// exclusions (draining, ineligible, datacenter) appear only in the metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureTally {
    groups: BTreeMap<String, AllocMetric>,
    reasons: BTreeMap<FailureReason, u32>,
    quota_limit_reached: Option<String>,
}

impl FailureTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the filter outcome for a task group.
    pub fn record_evaluated(&mut self, candidates: &GroupCandidates<'_>) {
        let metric = self.groups.entry(candidates.group.name.to_string()).or_default();
        metric.nodes_evaluated += candidates.nodes_evaluated() as u32;
        metric.nodes_filtered += candidates.excluded.len() as u32;
        for reason in candidates.excluded.values() {
            *metric
                .class_filtered
                .entry(reason.metric_key().to_string())
                .or_default() += 1;
            if let ExclusionReason::Constraint(c) = reason {
                *metric.constraint_filtered.entry(c.clone()).or_default() += 1;
                *self.reasons.entry(FailureReason::ConstraintFiltered).or_default() += 1;
            }
        }
    }

    /// An eligible node had no room for the group.
    pub fn record_exhausted(&mut self, group: &str, dimension: Dimension) {
        let metric = self.metric_mut(group);
        metric.nodes_exhausted += 1;
        *metric
            .dimension_exhausted
            .entry(dimension.as_str().to_string())
            .or_default() += 1;
        metric.coalesced_failures += 1;
        *self.reasons.entry(FailureReason::ResourcesExhausted).or_default() += 1;
    }

    /// The quota accountant refused a placement for the group.
    pub fn record_quota(&mut self, group: &str, rejection: &QuotaRejection) {
        let metric = self.metric_mut(group);
        *metric
            .quota_exhausted
            .entry(rejection.metric_key())
            .or_default() += 1;
        metric.coalesced_failures += 1;
        *self.reasons.entry(FailureReason::QuotaExhausted).or_default() += 1;
        if self.quota_limit_reached.is_none() {
            self.quota_limit_reached = Some(rejection.quota.clone());
        }
    }

    fn metric_mut(&mut self, group: &str) -> &mut AllocMetric {
        self.groups.entry(group.to_string()).or_default()
    }

    pub fn metric(&self, group: &str) -> Option<&AllocMetric> {
        self.groups.get(group)
    }

    pub fn count(&self, reason: FailureReason) -> u32 {
        self.reasons.get(&reason).copied().unwrap_or(0)
    }

    /// Wanted instances left unplaced, across all groups.
    pub fn placement_failures(&self) -> u32 {
        self.reasons
            .iter()
            .filter(|(reason, _)| reason.is_placement_failure())
            .map(|(_, count)| count)
            .sum()
    }

    pub fn has_placement_failures(&self) -> bool {
        self.placement_failures() > 0
    }

    /// Unplaced instances per task group, including groups with none.
    pub fn queued(&self) -> BTreeMap<String, u32> {
        self.groups
            .iter()
            .map(|(name, metric)| (name.clone(), metric.coalesced_failures))
            .collect()
    }

    /// Metrics of the groups that could not be fully placed.
    pub fn failed_groups(&self) -> BTreeMap<String, AllocMetric> {
        self.groups
            .iter()
            .filter(|(_, metric)| metric.coalesced_failures > 0)
            .map(|(name, metric)| (name.clone(), metric.clone()))
            .collect()
    }

    /// First quota that refused a placement.
    pub fn quota_limit_reached(&self) -> Option<&str> {
        self.quota_limit_reached.as_deref()
    }
}
