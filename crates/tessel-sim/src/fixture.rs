//! TOML cluster fixtures.
//!
//! A fixture describes a whole cluster: scheduler settings, namespaces,
//! quota specs, nodes, jobs, and any allocations that already exist.
//!
//! ```toml
//! [scheduler]
//! blocked_evals = "create"
//!
//! [[quotas]]
//! name = "team"
//! [[quotas.limits]]
//! region = "global"
//! region_limit = { cpu = 2000, memory_mb = 1024 }
//!
//! [[nodes]]
//! id = "node-01"
//! datacenter = "dc1"
//! status = "ready"
//! resources = { cpu = 4000, memory_mb = 8192 }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tessel_scheduler::SchedulerConfig;
use tessel_state::{Allocation, Job, JobType, Namespace, Node, QuotaSpec, StateResult, StateStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterFixture {
    pub scheduler: SchedulerConfig,
    pub namespaces: Vec<Namespace>,
    pub quotas: Vec<QuotaSpec>,
    pub nodes: Vec<Node>,
    pub jobs: Vec<Job>,
    pub allocations: Vec<Allocation>,
}

impl ClusterFixture {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing fixture {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let fixture: ClusterFixture = toml::from_str(content)?;
        fixture.validate()?;
        Ok(fixture)
    }

    /// A namespace bound to an unknown quota is only warned about; every
    /// placement in it will be rejected.
    fn validate(&self) -> anyhow::Result<()> {
        for ns in &self.namespaces {
            if let Some(quota) = &ns.quota {
                if !self.quotas.iter().any(|q| &q.name == quota) {
                    warn!(namespace = %ns.name, quota = %quota, "namespace references unknown quota");
                }
            }
        }
        for job in &self.jobs {
            anyhow::ensure!(
                !job.task_groups.is_empty(),
                "job {}/{} has no task groups",
                job.namespace,
                job.id
            );
        }
        Ok(())
    }

    /// Write every record into `store`.
    pub fn seed(&self, store: &StateStore) -> StateResult<()> {
        for spec in &self.quotas {
            store.put_quota_spec(spec)?;
        }
        for ns in &self.namespaces {
            store.put_namespace(ns)?;
        }
        for node in &self.nodes {
            store.put_node(node)?;
        }
        for job in &self.jobs {
            store.put_job(job)?;
        }
        if !self.allocations.is_empty() {
            store.put_allocs(&self.allocations)?;
        }
        info!(
            nodes = self.nodes.len(),
            jobs = self.jobs.len(),
            namespaces = self.namespaces.len(),
            quotas = self.quotas.len(),
            allocations = self.allocations.len(),
            "fixture seeded"
        );
        Ok(())
    }

    pub fn system_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.job_type == JobType::System)
    }
}
