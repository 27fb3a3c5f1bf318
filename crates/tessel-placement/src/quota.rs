//! Quota accountant.
//!
//! Tracks the resources reserved against each quota spec for the duration
//! of one evaluation. Usage is seeded from the snapshot's non-terminal
//! allocations and grows as placements are admitted, so later admission
//! checks in the same evaluation see earlier decisions.
//!
//! Namespaces that share a quota spec draw from the same running total.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::debug;

use tessel_state::{Dimension, QuotaResources, Resources, StateSnapshot};

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaRejection {
    pub quota: String,
    /// Exhausted dimension; `None` when the quota spec itself is missing.
    pub dimension: Option<Dimension>,
}

impl QuotaRejection {
    /// `<quota>: <dimension>`, the key used in quota metrics.
    pub fn metric_key(&self) -> String {
        format!("{}: {}", self.quota, self.dimension_label())
    }

    pub fn dimension_label(&self) -> &'static str {
        match self.dimension {
            Some(dim) => dim.as_str(),
            None => "missing spec",
        }
    }
}

impl fmt::Display for QuotaRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quota {} exhausted on {}", self.quota, self.dimension_label())
    }
}

/// Answer to a reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected(QuotaRejection),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Per-evaluation quota usage, keyed by quota spec name.
#[derive(Debug, Clone)]
pub struct QuotaAccountant {
    region: String,
    /// Namespace name to bound quota name.
    bindings: HashMap<String, String>,
    /// Region limit of every quota spec present in the snapshot.
    /// `None` when the spec has no limit for this region.
    limits: HashMap<String, Option<QuotaResources>>,
    usage: BTreeMap<String, Resources>,
    saturated: BTreeMap<String, BTreeSet<Dimension>>,
}

impl QuotaAccountant {
    /// Seed usage from every non-terminal allocation in a quota-bound namespace.
    pub fn from_snapshot(snapshot: &StateSnapshot, region: &str) -> Self {
        let bindings: HashMap<String, String> = snapshot
            .namespaces()
            .filter_map(|ns| ns.quota.as_ref().map(|q| (ns.name.clone(), q.clone())))
            .collect();

        let limits = snapshot
            .quota_specs()
            .map(|spec| {
                let limit = spec.limit_for_region(region).map(|l| l.region_limit);
                (spec.name.clone(), limit)
            })
            .collect();

        let mut usage: BTreeMap<String, Resources> = BTreeMap::new();
        for alloc in snapshot.allocs().filter(|a| !a.is_terminal()) {
            if let Some(quota) = bindings.get(&alloc.namespace) {
                usage.entry(quota.clone()).or_default().add(&alloc.resources);
            }
        }

        Self {
            region: region.to_string(),
            bindings,
            limits,
            usage,
            saturated: BTreeMap::new(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Quota bound to `namespace`, if any.
    pub fn quota_for(&self, namespace: &str) -> Option<&str> {
        self.bindings.get(namespace).map(String::as_str)
    }

    /// Reserve `resources` for a placement in `namespace`.
    ///
    /// On admission the running total grows by `resources`. A dimension
    /// that rejects once stays saturated for the rest of the evaluation.
    pub fn try_reserve(&mut self, namespace: &str, resources: &Resources) -> Admission {
        let Some(quota) = self.bindings.get(namespace) else {
            return Admission::Admitted;
        };
        let Some(limit) = self.limits.get(quota) else {
            debug!(namespace, quota = %quota, "namespace bound to missing quota spec");
            return Admission::Rejected(QuotaRejection {
                quota: quota.clone(),
                dimension: None,
            });
        };

        if let Some(saturated) = self.saturated.get(quota) {
            if let Some(dim) = Dimension::ALL
                .into_iter()
                .find(|dim| resources.get(*dim) > 0 && saturated.contains(dim))
            {
                return Admission::Rejected(QuotaRejection {
                    quota: quota.clone(),
                    dimension: Some(dim),
                });
            }
        }

        let current = self.usage.get(quota).copied().unwrap_or_default();
        let proposed = current.plus(resources);

        if let Some(limit) = limit {
            let exceeded = limit.exceeded_by(&proposed);
            if let Some(first) = exceeded.first().copied() {
                debug!(
                    namespace,
                    quota = %quota,
                    dimension = %first,
                    used = current.get(first),
                    requested = resources.get(first),
                    "quota reservation rejected"
                );
                self.saturated
                    .entry(quota.clone())
                    .or_default()
                    .extend(exceeded);
                return Admission::Rejected(QuotaRejection {
                    quota: quota.clone(),
                    dimension: Some(first),
                });
            }
        }

        self.usage.insert(quota.clone(), proposed);
        Admission::Admitted
    }

    /// Return capacity freed by an eviction decided in this evaluation.
    pub fn release(&mut self, namespace: &str, resources: &Resources) {
        if let Some(quota) = self.bindings.get(namespace) {
            if let Some(used) = self.usage.get_mut(quota) {
                used.subtract(resources);
            }
        }
    }

    /// Running total reserved against `quota`.
    pub fn usage(&self, quota: &str) -> Resources {
        self.usage.get(quota).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_state::{AllocStatus, Allocation, Namespace, QuotaLimit, QuotaSpec};

    fn make_snapshot(limit: QuotaResources) -> StateSnapshot {
        let mut snap = StateSnapshot::default();
        snap.upsert_quota_spec(QuotaSpec {
            name: "team".to_string(),
            description: String::new(),
            limits: vec![QuotaLimit {
                region: "global".to_string(),
                region_limit: limit,
            }],
        });
        for (name, quota) in [("prod", Some("team")), ("staging", Some("team")), ("free", None)] {
            snap.upsert_namespace(Namespace {
                name: name.to_string(),
                description: String::new(),
                quota: quota.map(str::to_string),
            });
        }
        snap
    }

    fn cpu_mem(cpu: u64, memory_mb: u64) -> QuotaResources {
        QuotaResources {
            cpu: Some(cpu),
            memory_mb: Some(memory_mb),
            disk_mb: None,
        }
    }

    fn make_alloc(id: &str, namespace: &str, status: AllocStatus) -> Allocation {
        Allocation {
            id: id.to_string(),
            eval_id: "e0".to_string(),
            name: "job.web[0]".to_string(),
            namespace: namespace.to_string(),
            job_id: "job".to_string(),
            task_group: "web".to_string(),
            node_id: "n1".to_string(),
            resources: Resources::new(500, 256),
            status,
            status_description: String::new(),
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn admits_until_limit_then_rejects() {
        let snap = make_snapshot(cpu_mem(2000, 1024));
        let mut acct = QuotaAccountant::from_snapshot(&snap, "global");
        let ask = Resources::new(500, 256);

        for _ in 0..4 {
            assert!(acct.try_reserve("prod", &ask).is_admitted());
        }
        assert_eq!(
            acct.try_reserve("prod", &ask),
            Admission::Rejected(QuotaRejection {
                quota: "team".to_string(),
                dimension: Some(Dimension::Cpu),
            })
        );
        assert_eq!(acct.usage("team"), Resources::new(2000, 1024));
    }

    #[test]
    fn unbound_namespace_is_unlimited() {
        let snap = make_snapshot(cpu_mem(1, 1));
        let mut acct = QuotaAccountant::from_snapshot(&snap, "global");
        assert!(acct.try_reserve("free", &Resources::new(10_000, 10_000)).is_admitted());
        assert!(acct.try_reserve("unknown", &Resources::new(10_000, 10_000)).is_admitted());
        assert_eq!(acct.usage("team"), Resources::default());
    }

    #[test]
    fn missing_spec_fails_closed() {
        let mut snap = StateSnapshot::default();
        snap.upsert_namespace(Namespace {
            name: "prod".to_string(),
            description: String::new(),
            quota: Some("ghost".to_string()),
        });
        let mut acct = QuotaAccountant::from_snapshot(&snap, "global");
        let Admission::Rejected(rejection) = acct.try_reserve("prod", &Resources::new(1, 1)) else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.dimension, None);
        assert_eq!(rejection.metric_key(), "ghost: missing spec");
    }

    #[test]
    fn seeds_usage_from_live_allocs_across_shared_namespaces() {
        let mut snap = make_snapshot(cpu_mem(2000, 1024));
        snap.upsert_alloc(make_alloc("a1", "prod", AllocStatus::Running));
        snap.upsert_alloc(make_alloc("a2", "staging", AllocStatus::Pending));
        snap.upsert_alloc(make_alloc("a3", "prod", AllocStatus::Complete));
        snap.upsert_alloc(make_alloc("a4", "free", AllocStatus::Running));

        let mut acct = QuotaAccountant::from_snapshot(&snap, "global");
        assert_eq!(acct.usage("team"), Resources::new(1000, 512));
        assert!(acct.try_reserve("staging", &Resources::new(500, 256)).is_admitted());
        assert!(acct.try_reserve("prod", &Resources::new(500, 256)).is_admitted());
        assert!(!acct.try_reserve("prod", &Resources::new(1, 0)).is_admitted());
    }

    #[test]
    fn saturated_dimension_stays_rejected() {
        let snap = make_snapshot(cpu_mem(2000, 300));
        let mut acct = QuotaAccountant::from_snapshot(&snap, "global");
        assert!(acct.try_reserve("prod", &Resources::new(100, 256)).is_admitted());
        assert!(!acct.try_reserve("prod", &Resources::new(100, 256)).is_admitted());

        // Would fit arithmetically, but memory is already saturated.
        let small = acct.try_reserve("prod", &Resources::new(100, 10));
        assert_eq!(
            small,
            Admission::Rejected(QuotaRejection {
                quota: "team".to_string(),
                dimension: Some(Dimension::Memory),
            })
        );
        // Requests that leave the saturated dimension alone are still checked normally.
        assert!(acct.try_reserve("prod", &Resources::new(100, 0)).is_admitted());
    }

    #[test]
    fn release_returns_capacity() {
        let mut snap = make_snapshot(cpu_mem(1000, 512));
        snap.upsert_alloc(make_alloc("a1", "prod", AllocStatus::Running));
        snap.upsert_alloc(make_alloc("a2", "prod", AllocStatus::Running));

        let mut acct = QuotaAccountant::from_snapshot(&snap, "global");
        acct.release("prod", &Resources::new(500, 256));
        assert!(acct.try_reserve("prod", &Resources::new(500, 256)).is_admitted());
        assert_eq!(acct.usage("team"), Resources::new(1000, 512));
    }

    #[test]
    fn spec_without_region_limit_admits() {
        let snap = make_snapshot(cpu_mem(1, 1));
        let mut acct = QuotaAccountant::from_snapshot(&snap, "eu");
        assert_eq!(acct.region(), "eu");
        assert!(acct.try_reserve("prod", &Resources::new(500, 256)).is_admitted());
        assert_eq!(acct.usage("team"), Resources::new(500, 256));
        assert_eq!(acct.quota_for("prod"), Some("team"));
    }
}
