//! Domain types for the Tessel state store.
//!
//! These types represent the persisted state of jobs, nodes, allocations,
//! namespaces, quota specs, and evaluations, plus the transient `Plan`
//! produced by one evaluation. All types are serializable to/from JSON
//! for storage in redb tables.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier for a job (namespace-scoped).
pub type JobId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for an allocation.
pub type AllocId = String;

/// Unique identifier for an evaluation.
pub type EvalId = String;

/// Namespace used when a job or evaluation does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Region used when a job does not name one.
pub const DEFAULT_REGION: &str = "global";

// ── Resources ─────────────────────────────────────────────────────

/// A tracked resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,
    Memory,
    Disk,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Cpu, Dimension::Memory, Dimension::Disk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
            Dimension::Disk => "disk",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources reserved by an allocation or offered by a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in MHz shares.
    #[serde(default)]
    pub cpu: u64,
    /// Memory in megabytes.
    #[serde(default)]
    pub memory_mb: u64,
    /// Disk in megabytes.
    #[serde(default)]
    pub disk_mb: u64,
}

impl Resources {
    pub fn new(cpu: u64, memory_mb: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            disk_mb: 0,
        }
    }

    pub fn get(&self, dim: Dimension) -> u64 {
        match dim {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory_mb,
            Dimension::Disk => self.disk_mb,
        }
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpu = self.cpu.saturating_add(other.cpu);
        self.memory_mb = self.memory_mb.saturating_add(other.memory_mb);
        self.disk_mb = self.disk_mb.saturating_add(other.disk_mb);
    }

    pub fn subtract(&mut self, other: &Resources) {
        self.cpu = self.cpu.saturating_sub(other.cpu);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
        self.disk_mb = self.disk_mb.saturating_sub(other.disk_mb);
    }

    pub fn plus(&self, other: &Resources) -> Resources {
        let mut sum = *self;
        sum.add(other);
        sum
    }

    /// First dimension in which `self` exceeds `capacity`, if any.
    pub fn exceeds(&self, capacity: &Resources) -> Option<Dimension> {
        Dimension::ALL
            .into_iter()
            .find(|dim| self.get(*dim) > capacity.get(*dim))
    }
}

/// Quota limits for one region. An absent dimension is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_mb: Option<u64>,
}

impl QuotaResources {
    pub fn limit(&self, dim: Dimension) -> Option<u64> {
        match dim {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory_mb,
            Dimension::Disk => self.disk_mb,
        }
    }

    /// Dimensions in which `usage` is over the limit, in [`Dimension::ALL`] order.
    pub fn exceeded_by(&self, usage: &Resources) -> Vec<Dimension> {
        Dimension::ALL
            .into_iter()
            .filter(|dim| self.limit(*dim).is_some_and(|limit| usage.get(*dim) > limit))
            .collect()
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

/// Scheduling strategy of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Service,
    Batch,
    System,
    Sysbatch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Service => "service",
            JobType::Batch => "batch",
            JobType::System => "system",
            JobType::Sysbatch => "sysbatch",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hard placement constraint matched against node properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub l_target: String,
    #[serde(default)]
    pub r_target: String,
    #[serde(default = "default_operand")]
    pub operand: String,
}

fn default_operand() -> String {
    "=".to_string()
}

impl Constraint {
    pub fn new(l_target: &str, operand: &str, r_target: &str) -> Self {
        Self {
            l_target: l_target.to_string(),
            r_target: r_target.to_string(),
            operand: operand.to_string(),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.l_target, self.operand, self.r_target)
    }
}

/// A group of tasks placed together; one instance per node for system jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    /// Resources reserved by each instance.
    pub resources: Resources,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// Specification of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Datacenters the job may run in. `*` matches every datacenter.
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Stopped jobs keep their record but want no running allocations.
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    pub task_groups: Vec<TaskGroup>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_priority() -> u32 {
    50
}

impl Job {
    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    /// Build the composite key for the jobs table.
    pub fn table_key(&self) -> String {
        job_key(&self.namespace, &self.id)
    }
}

/// Composite key of a job: `{namespace}/{job_id}`.
pub fn job_key(namespace: &str, job_id: &str) -> String {
    format!("{namespace}/{job_id}")
}

// ── Nodes ─────────────────────────────────────────────────────────

/// Client-reported status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Initializing,
    Ready,
    Down,
}

/// Operator-controlled scheduling eligibility of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
}

/// A client machine in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    pub datacenter: String,
    #[serde(default)]
    pub node_class: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub scheduling_eligibility: SchedulingEligibility,
    /// Set while the node is being drained of its allocations.
    #[serde(default)]
    pub drain: bool,
    /// Fingerprinted attributes (`${attr.<key>}` in constraints).
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Operator metadata (`${meta.<key>}` in constraints).
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// Total resources of the machine.
    pub resources: Resources,
    /// Resources held back for the OS and agent.
    #[serde(default)]
    pub reserved: Resources,
}

impl Node {
    pub fn is_ready(&self) -> bool {
        self.status == NodeStatus::Ready
    }

    /// Resources available to allocations.
    pub fn allocatable(&self) -> Resources {
        let mut capacity = self.resources;
        capacity.subtract(&self.reserved);
        capacity
    }
}

// ── Allocations ───────────────────────────────────────────────────

/// Lifecycle status of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    Evicted,
}

impl AllocStatus {
    /// Terminal allocations no longer consume quota or node capacity.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocStatus::Complete | AllocStatus::Failed | AllocStatus::Lost | AllocStatus::Evicted
        )
    }
}

/// One placed instance of a task group on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    pub eval_id: EvalId,
    /// `<job>.<group>[<index>]`
    pub name: String,
    pub namespace: String,
    pub job_id: JobId,
    pub task_group: String,
    pub node_id: NodeId,
    pub resources: Resources,
    pub status: AllocStatus,
    #[serde(default)]
    pub status_description: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Allocation {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Build the composite key for the allocations table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", job_key(&self.namespace, &self.job_id), self.id)
    }
}

// ── Namespaces and quotas ─────────────────────────────────────────

/// A namespace, optionally bound to a quota spec by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<String>,
}

/// Limits for one region of a quota spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimit {
    #[serde(default = "default_region")]
    pub region: String,
    pub region_limit: QuotaResources,
}

/// Aggregate resource limits shared by every namespace that references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub limits: Vec<QuotaLimit>,
}

impl QuotaSpec {
    pub fn limit_for_region(&self, region: &str) -> Option<&QuotaLimit> {
        self.limits.iter().find(|l| l.region == region)
    }
}

// ── Evaluations ───────────────────────────────────────────────────

/// Reasons an evaluation can be triggered.
pub mod triggers {
    pub const JOB_REGISTER: &str = "job-register";
    pub const JOB_DEREGISTER: &str = "job-deregister";
    pub const PERIODIC_JOB: &str = "periodic-job";
    pub const NODE_UPDATE: &str = "node-update";
    pub const NODE_DRAIN: &str = "node-drain";
    pub const ALLOC_STOP: &str = "alloc-stop";
    pub const ROLLING_UPDATE: &str = "rolling-update";
    pub const QUEUED_ALLOCS: &str = "queued-allocs";
    pub const MAX_PLAN_ATTEMPTS: &str = "max-plan-attempts";
    pub const FAILED_FOLLOW_UP: &str = "failed-follow-up";
    pub const QUOTA_LIMIT: &str = "quota-limit";
    pub const PREEMPTION: &str = "preemption";
}

/// Status of an evaluation. Transitions only move forward:
/// `blocked → pending → {complete, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Blocked,
    Pending,
    Complete,
    Failed,
    Cancelled,
}

impl EvalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            EvalStatus::Blocked => 0,
            EvalStatus::Pending => 1,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Cancelled => 2,
        }
    }

    pub fn can_transition_to(&self, next: EvalStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Blocked => "blocked",
            EvalStatus::Pending => "pending",
            EvalStatus::Complete => "complete",
            EvalStatus::Failed => "failed",
            EvalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement metrics for one task group within one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocMetric {
    /// Nodes considered for the group.
    pub nodes_evaluated: u32,
    /// Nodes removed by the eligibility filter.
    pub nodes_filtered: u32,
    /// Filter exclusions by reason (`draining`, `constraint`, ...).
    pub class_filtered: BTreeMap<String, u32>,
    /// Filter exclusions by the failing constraint.
    pub constraint_filtered: BTreeMap<String, u32>,
    /// Eligible nodes without room for the group.
    pub nodes_exhausted: u32,
    /// Node exhaustion by dimension.
    pub dimension_exhausted: BTreeMap<String, u32>,
    /// Quota rejections keyed by `<quota>: <dimension>`.
    pub quota_exhausted: BTreeMap<String, u32>,
    /// Placements that failed in this evaluation.
    pub coalesced_failures: u32,
}

/// A unit of scheduling work for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub triggered_by: String,
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub status: EvalStatus,
    #[serde(default)]
    pub status_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_eval: Option<EvalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_eval: Option<EvalId>,
    /// Metrics for task groups that could not be fully placed.
    #[serde(default)]
    pub failed_tg_allocs: BTreeMap<String, AllocMetric>,
    /// Instances per task group still waiting for placement.
    #[serde(default)]
    pub queued_allocations: BTreeMap<String, u32>,
    /// Quota that blocked placement, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_limit_reached: Option<String>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Evaluation {
    /// A pending evaluation for `job`, triggered by `triggered_by`.
    pub fn for_job(id: &str, job: &Job, triggered_by: &str) -> Self {
        Self {
            id: id.to_string(),
            namespace: job.namespace.clone(),
            priority: job.priority,
            job_type: job.job_type,
            triggered_by: triggered_by.to_string(),
            job_id: job.id.clone(),
            node_id: None,
            status: EvalStatus::Pending,
            status_description: String::new(),
            previous_eval: None,
            blocked_eval: None,
            failed_tg_allocs: BTreeMap::new(),
            queued_allocations: BTreeMap::new(),
            quota_limit_reached: None,
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, refusing any transition that is not strictly forward.
    pub fn transition(&mut self, next: EvalStatus, description: &str) -> StateResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.status_description = description.to_string();
        Ok(())
    }
}

// ── Plans ─────────────────────────────────────────────────────────

/// Mutations computed by one evaluation, applied as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: EvalId,
    pub namespace: String,
    pub job_id: JobId,
    pub priority: u32,
    /// Region the evaluation charged quota against.
    #[serde(default = "default_region")]
    pub region: String,
    /// The job as read by the evaluation; `None` when it was deregistered.
    pub job: Option<Job>,
    /// Allocations to stop, by node.
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    /// Allocations to create, by node.
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
}

impl Plan {
    pub fn is_no_op(&self) -> bool {
        self.node_update.is_empty() && self.node_allocation.is_empty()
    }

    pub fn placements(&self) -> impl Iterator<Item = &Allocation> {
        self.node_allocation.values().flatten()
    }

    pub fn evictions(&self) -> impl Iterator<Item = &Allocation> {
        self.node_update.values().flatten()
    }
}

/// What the applier committed for a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    /// Store index at which the plan was committed.
    pub alloc_index: u64,
}

/// Result of handing a plan to the applier.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    /// The whole plan was committed.
    Applied(PlanResult),
    /// Current state no longer admits the plan; nothing was committed.
    Conflict(String),
}
