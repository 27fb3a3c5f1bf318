//! StateStore — redb-backed state persistence for Tessel.
//!
//! Provides typed CRUD operations over jobs, nodes, allocations,
//! namespaces, quota specs, and evaluations. All values are JSON-serialized
//! into redb's `&[u8]` value columns. Every write bumps a store-wide index
//! kept in the `meta` table, which is stamped onto the records it touches.
//!
//! Two operations give the scheduler its consistency guarantees:
//!
//! - [`StateStore::snapshot`] reads every table inside one read
//!   transaction, yielding a point-in-time [`StateSnapshot`].
//! - [`StateStore::commit_plan`] re-validates a plan against current state
//!   and applies it inside one write transaction. redb admits a single
//!   writer at a time, so the check and the write cannot interleave with
//!   another plan.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::snapshot::{SnapshotSource, StateSnapshot};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [JOBS, NODES, ALLOCS, NAMESPACES, QUOTAS, EVALS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(ALLOC_KEYS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Latest committed write index.
    pub fn latest_index(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let index = table
            .get(LATEST_INDEX)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(index)
    }

    // ── Generic record access ──────────────────────────────────────

    /// Run `f` in a write transaction at the next store index and commit.
    fn write<F>(&self, f: F) -> StateResult<u64>
    where
        F: FnOnce(&WriteTransaction, u64) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let index = bump_index(&txn)?;
        f(&txn, index)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(index)
    }

    fn get_record<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, table: RecordTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    fn delete_record(&self, table: RecordTable, key: &str) -> StateResult<bool> {
        let mut existed = false;
        self.write(|txn, _| {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
            Ok(())
        })?;
        Ok(existed)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a job. Returns the write index.
    pub fn put_job(&self, job: &Job) -> StateResult<u64> {
        let mut job = job.clone();
        let index = self.write(|txn, index| {
            if job.create_index == 0 {
                job.create_index = index;
            }
            job.modify_index = index;
            put_json(txn, JOBS, &job.table_key(), &job)
        })?;
        debug!(job = %job.id, namespace = %job.namespace, index, "job stored");
        Ok(index)
    }

    pub fn get_job(&self, namespace: &str, job_id: &str) -> StateResult<Option<Job>> {
        self.get_record(JOBS, &job_key(namespace, job_id))
    }

    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.list_records(JOBS, "")
    }

    pub fn delete_job(&self, namespace: &str, job_id: &str) -> StateResult<bool> {
        self.delete_record(JOBS, &job_key(namespace, job_id))
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &Node) -> StateResult<u64> {
        self.write(|txn, _| put_json(txn, NODES, &node.id, node))
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get_record(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_records(NODES, "")
    }

    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete_record(NODES, node_id)
    }

    /// Set or clear the drain flag of a node.
    pub fn update_node_drain(&self, node_id: &str, drain: bool) -> StateResult<u64> {
        let mut node = self
            .get_node(node_id)?
            .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
        node.drain = drain;
        let index = self.put_node(&node)?;
        info!(node = %node_id, drain, index, "node drain updated");
        Ok(index)
    }

    /// Set the scheduling eligibility of a node.
    pub fn update_node_eligibility(
        &self,
        node_id: &str,
        eligibility: SchedulingEligibility,
    ) -> StateResult<u64> {
        let mut node = self
            .get_node(node_id)?
            .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
        node.scheduling_eligibility = eligibility;
        self.put_node(&node)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or update allocations in one transaction.
    pub fn put_allocs(&self, allocs: &[Allocation]) -> StateResult<u64> {
        self.write(|txn, index| {
            for alloc in allocs {
                let mut alloc = alloc.clone();
                if alloc.create_index == 0 {
                    alloc.create_index = index;
                }
                alloc.modify_index = index;
                put_alloc(txn, &alloc)?;
            }
            Ok(())
        })
    }

    /// Get an allocation by ID.
    pub fn get_alloc(&self, alloc_id: &str) -> StateResult<Option<Allocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let key = {
            let keys = txn.open_table(ALLOC_KEYS).map_err(map_err!(Table))?;
            match keys.get(alloc_id).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_string(),
                None => return Ok(None),
            }
        };
        let allocs = txn.open_table(ALLOCS).map_err(map_err!(Table))?;
        match allocs.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List allocations of a job.
    pub fn list_allocs_by_job(
        &self,
        namespace: &str,
        job_id: &str,
        include_terminal: bool,
    ) -> StateResult<Vec<Allocation>> {
        let prefix = format!("{}/", job_key(namespace, job_id));
        let allocs: Vec<Allocation> = self.list_records(ALLOCS, &prefix)?;
        // A longer job ID such as `agent/periodic-1` shares the prefix.
        Ok(allocs
            .into_iter()
            .filter(|a| a.namespace == namespace && a.job_id == job_id)
            .filter(|a| include_terminal || !a.is_terminal())
            .collect())
    }

    /// List allocations placed on a node.
    pub fn list_allocs_by_node(&self, node_id: &str, include_terminal: bool) -> StateResult<Vec<Allocation>> {
        let allocs: Vec<Allocation> = self.list_records(ALLOCS, "")?;
        Ok(allocs
            .into_iter()
            .filter(|a| a.node_id == node_id)
            .filter(|a| include_terminal || !a.is_terminal())
            .collect())
    }

    /// Record a client-side status change of an allocation.
    pub fn update_alloc_status(&self, alloc_id: &str, status: AllocStatus) -> StateResult<u64> {
        let mut alloc = self
            .get_alloc(alloc_id)?
            .ok_or_else(|| StateError::NotFound(format!("allocation {alloc_id}")))?;
        alloc.status = status;
        self.put_allocs(std::slice::from_ref(&alloc))
    }

    // ── Namespaces and quotas ──────────────────────────────────────

    pub fn put_namespace(&self, namespace: &Namespace) -> StateResult<u64> {
        self.write(|txn, _| put_json(txn, NAMESPACES, &namespace.name, namespace))
    }

    pub fn get_namespace(&self, name: &str) -> StateResult<Option<Namespace>> {
        self.get_record(NAMESPACES, name)
    }

    pub fn put_quota_spec(&self, spec: &QuotaSpec) -> StateResult<u64> {
        self.write(|txn, _| put_json(txn, QUOTAS, &spec.name, spec))
    }

    pub fn get_quota_spec(&self, name: &str) -> StateResult<Option<QuotaSpec>> {
        self.get_record(QUOTAS, name)
    }

    pub fn delete_quota_spec(&self, name: &str) -> StateResult<bool> {
        self.delete_record(QUOTAS, name)
    }

    // ── Evaluations ────────────────────────────────────────────────

    /// Insert or update evaluations in one transaction.
    pub fn put_evals(&self, evals: &[Evaluation]) -> StateResult<u64> {
        self.write(|txn, index| {
            for eval in evals {
                let mut eval = eval.clone();
                if eval.create_index == 0 {
                    eval.create_index = index;
                }
                eval.modify_index = index;
                put_json(txn, EVALS, &eval.id, &eval)?;
            }
            Ok(())
        })
    }

    pub fn get_eval(&self, eval_id: &str) -> StateResult<Option<Evaluation>> {
        self.get_record(EVALS, eval_id)
    }

    pub fn list_evals(&self) -> StateResult<Vec<Evaluation>> {
        self.list_records(EVALS, "")
    }

    // ── Snapshots and plans ────────────────────────────────────────

    /// Read every table in one read transaction.
    pub fn snapshot(&self) -> StateResult<StateSnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = {
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.get(LATEST_INDEX)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
        };
        let snapshot = build_snapshot(index, |table| {
            raw_values(&txn.open_table(table).map_err(map_err!(Table))?)
        })?;
        debug!(index, "snapshot taken");
        Ok(snapshot)
    }

    /// Validate `plan` against current state and apply it atomically.
    ///
    /// Returns [`PlanOutcome::Conflict`] without writing anything when the
    /// plan would place onto an unusable node, duplicate a live allocation
    /// of the same job and task group, overrun node capacity, or exceed a
    /// namespace quota.
    pub fn commit_plan(&self, plan: &Plan) -> StateResult<PlanOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current_index = {
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.get(LATEST_INDEX)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
        };
        let current = build_snapshot(current_index, |table| {
            raw_values(&txn.open_table(table).map_err(map_err!(Table))?)
        })?;

        if let Err(reason) = check_plan(&current, plan) {
            warn!(eval_id = %plan.eval_id, job = %plan.job_id, %reason, "plan rejected at commit");
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(PlanOutcome::Conflict(reason));
        }

        let index = bump_index(&txn)?;
        let mut node_update: BTreeMap<NodeId, Vec<Allocation>> = BTreeMap::new();
        let mut node_allocation: BTreeMap<NodeId, Vec<Allocation>> = BTreeMap::new();

        for stop in plan.evictions() {
            let Some(existing) = current.allocs().find(|a| a.id == stop.id) else {
                debug!(alloc = %stop.id, "evicted allocation no longer exists");
                continue;
            };
            if existing.is_terminal() {
                continue;
            }
            let mut updated = existing.clone();
            updated.status = stop.status;
            updated.status_description = stop.status_description.clone();
            updated.modify_index = index;
            put_json(&txn, ALLOCS, &updated.table_key(), &updated)?;
            node_update.entry(updated.node_id.clone()).or_default().push(updated);
        }

        for place in plan.placements() {
            let mut placed = place.clone();
            placed.create_index = index;
            placed.modify_index = index;
            put_alloc(&txn, &placed)?;
            node_allocation.entry(placed.node_id.clone()).or_default().push(placed);
        }

        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            eval_id = %plan.eval_id,
            job = %plan.job_id,
            index,
            placed = node_allocation.values().map(Vec::len).sum::<usize>(),
            stopped = node_update.values().map(Vec::len).sum::<usize>(),
            "plan committed"
        );

        Ok(PlanOutcome::Applied(PlanResult {
            node_update,
            node_allocation,
            alloc_index: index,
        }))
    }
}

impl SnapshotSource for StateStore {
    fn snapshot(&self) -> StateResult<StateSnapshot> {
        StateStore::snapshot(self)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn put_json<T: Serialize>(txn: &WriteTransaction, table: RecordTable, key: &str, value: &T) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Write an allocation and its ID index entry.
fn put_alloc(txn: &WriteTransaction, alloc: &Allocation) -> StateResult<()> {
    let key = alloc.table_key();
    put_json(txn, ALLOCS, &key, alloc)?;
    let mut keys = txn.open_table(ALLOC_KEYS).map_err(map_err!(Table))?;
    keys.insert(alloc.id.as_str(), key.as_str())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Increment and return the store-wide write index.
fn bump_index(txn: &WriteTransaction) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(LATEST_INDEX)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(LATEST_INDEX, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn raw_values(table: &impl ReadableTable<&'static str, &'static [u8]>) -> StateResult<Vec<Vec<u8>>> {
    let mut values = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        values.push(value.value().to_vec());
    }
    Ok(values)
}

/// Assemble a snapshot from raw table contents supplied by `load`.
fn build_snapshot<F>(index: u64, load: F) -> StateResult<StateSnapshot>
where
    F: Fn(RecordTable) -> StateResult<Vec<Vec<u8>>>,
{
    let mut snapshot = StateSnapshot::at_index(index);
    for raw in load(NODES)? {
        snapshot.upsert_node(decode(&raw)?);
    }
    for raw in load(JOBS)? {
        snapshot.upsert_job(decode(&raw)?);
    }
    for raw in load(ALLOCS)? {
        snapshot.upsert_alloc(decode(&raw)?);
    }
    for raw in load(NAMESPACES)? {
        snapshot.upsert_namespace(decode(&raw)?);
    }
    for raw in load(QUOTAS)? {
        snapshot.upsert_quota_spec(decode(&raw)?);
    }
    for raw in load(EVALS)? {
        snapshot.upsert_eval(decode(&raw)?);
    }
    Ok(snapshot)
}

/// Commit-time invariant check. `Err` carries the conflict reason.
fn check_plan(current: &StateSnapshot, plan: &Plan) -> Result<(), String> {
    let stopping: HashSet<&str> = plan.evictions().map(|a| a.id.as_str()).collect();
    let live = |alloc: &&Allocation| !alloc.is_terminal() && !stopping.contains(alloc.id.as_str());

    let mut placed_on_node: BTreeMap<&str, Resources> = BTreeMap::new();
    let mut placed_total = Resources::default();

    for place in plan.placements() {
        if current.allocs().any(|a| a.id == place.id) {
            return Err(format!("allocation {} already exists", place.id));
        }

        let node = current
            .node(&place.node_id)
            .ok_or_else(|| format!("node {} not found", place.node_id))?;
        if !node.is_ready()
            || node.drain
            || node.scheduling_eligibility == SchedulingEligibility::Ineligible
        {
            return Err(format!("node {} is not eligible for placement", node.id));
        }

        let duplicate = current
            .allocs_by_node(&node.id, false)
            .into_iter()
            .filter(live)
            .any(|a| {
                a.namespace == place.namespace
                    && a.job_id == place.job_id
                    && a.task_group == place.task_group
            });
        if duplicate {
            return Err(format!(
                "job {} group {} already has an allocation on node {}",
                place.job_id, place.task_group, node.id
            ));
        }

        let used = placed_on_node.entry(node.id.as_str()).or_insert_with(|| {
            let mut used = Resources::default();
            for alloc in current.allocs_by_node(&node.id, false).into_iter().filter(live) {
                used.add(&alloc.resources);
            }
            used
        });
        used.add(&place.resources);
        if let Some(dim) = used.exceeds(&node.allocatable()) {
            return Err(format!("node {} exhausted {dim}", node.id));
        }
        placed_total.add(&place.resources);
    }

    if placed_total == Resources::default() {
        return Ok(());
    }

    let Some(quota_name) = current
        .namespace(&plan.namespace)
        .and_then(|ns| ns.quota.clone())
    else {
        return Ok(());
    };
    let spec = current
        .quota_spec(&quota_name)
        .ok_or_else(|| format!("quota {quota_name} referenced by namespace {} not found", plan.namespace))?;
    let region = match plan.region.as_str() {
        "" => DEFAULT_REGION,
        region => region,
    };
    let Some(limit) = spec.limit_for_region(region) else {
        return Ok(());
    };

    let bound: HashSet<&str> = current
        .namespaces()
        .filter(|ns| ns.quota.as_deref() == Some(quota_name.as_str()))
        .map(|ns| ns.name.as_str())
        .collect();
    let mut usage = placed_total;
    for alloc in current.allocs().filter(live) {
        if bound.contains(alloc.namespace.as_str()) {
            usage.add(&alloc.resources);
        }
    }

    let exceeded = limit.region_limit.exceeded_by(&usage);
    if !exceeded.is_empty() {
        let dims: Vec<&str> = exceeded.iter().map(Dimension::as_str).collect();
        return Err(format!("quota {quota_name} exceeded on {}", dims.join(", ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            datacenter: "dc1".to_string(),
            node_class: String::new(),
            status: NodeStatus::Ready,
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: false,
            attributes: HashMap::new(),
            meta: HashMap::new(),
            resources: Resources::new(4000, 8192),
            reserved: Resources::default(),
        }
    }

    fn test_job(namespace: &str, id: &str) -> Job {
        Job {
            id: id.to_string(),
            namespace: namespace.to_string(),
            region: DEFAULT_REGION.to_string(),
            datacenters: vec!["dc1".to_string()],
            job_type: JobType::System,
            priority: 50,
            stop: false,
            version: 0,
            constraints: Vec::new(),
            task_groups: vec![TaskGroup {
                name: "web".to_string(),
                resources: Resources::new(500, 256),
                constraints: Vec::new(),
            }],
            create_index: 0,
            modify_index: 0,
        }
    }

    fn test_alloc(namespace: &str, job_id: &str, id: &str, node_id: &str) -> Allocation {
        Allocation {
            id: id.to_string(),
            eval_id: "eval-1".to_string(),
            name: format!("{job_id}.web[0]"),
            namespace: namespace.to_string(),
            job_id: job_id.to_string(),
            task_group: "web".to_string(),
            node_id: node_id.to_string(),
            resources: Resources::new(500, 256),
            status: AllocStatus::Pending,
            status_description: String::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    fn test_plan(namespace: &str, job: &Job, place: Vec<Allocation>, stop: Vec<Allocation>) -> Plan {
        let mut node_allocation: BTreeMap<NodeId, Vec<Allocation>> = BTreeMap::new();
        for alloc in place {
            node_allocation.entry(alloc.node_id.clone()).or_default().push(alloc);
        }
        let mut node_update: BTreeMap<NodeId, Vec<Allocation>> = BTreeMap::new();
        for alloc in stop {
            node_update.entry(alloc.node_id.clone()).or_default().push(alloc);
        }
        Plan {
            eval_id: "eval-1".to_string(),
            namespace: namespace.to_string(),
            job_id: job.id.clone(),
            priority: job.priority,
            region: DEFAULT_REGION.to_string(),
            job: Some(job.clone()),
            node_update,
            node_allocation,
        }
    }

    fn quota_store(memory_mb: u64) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_quota_spec(&QuotaSpec {
                name: "small".to_string(),
                description: String::new(),
                limits: vec![QuotaLimit {
                    region: DEFAULT_REGION.to_string(),
                    region_limit: QuotaResources {
                        cpu: None,
                        memory_mb: Some(memory_mb),
                        disk_mb: None,
                    },
                }],
            })
            .unwrap();
        store
            .put_namespace(&Namespace {
                name: "team".to_string(),
                description: String::new(),
                quota: Some("small".to_string()),
            })
            .unwrap();
        store
    }

    // ── CRUD ───────────────────────────────────────────────────────

    #[test]
    fn job_put_and_get_stamps_indexes() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("default", "agent");

        let first = store.put_job(&job).unwrap();
        let second = store.put_job(&job).unwrap();
        assert!(second > first);

        let stored = store.get_job("default", "agent").unwrap().unwrap();
        assert_eq!(stored.modify_index, second);
        assert!(store.get_job("default", "nope").unwrap().is_none());
    }

    #[test]
    fn node_crud_and_drain() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("n1")).unwrap();
        store.put_node(&test_node("n2")).unwrap();
        assert_eq!(store.list_nodes().unwrap().len(), 2);

        store.update_node_drain("n1", true).unwrap();
        assert!(store.get_node("n1").unwrap().unwrap().drain);

        assert!(store.delete_node("n2").unwrap());
        assert!(!store.delete_node("n2").unwrap());
        assert!(matches!(
            store.update_node_drain("n2", true),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn allocs_listed_by_job_and_node() {
        let store = StateStore::open_in_memory().unwrap();
        let mut done = test_alloc("default", "agent", "a3", "n2");
        done.status = AllocStatus::Complete;
        store
            .put_allocs(&[
                test_alloc("default", "agent", "a1", "n1"),
                test_alloc("default", "agent", "a2", "n2"),
                done,
                test_alloc("default", "agent-2", "b1", "n1"),
            ])
            .unwrap();

        assert_eq!(store.list_allocs_by_job("default", "agent", false).unwrap().len(), 2);
        assert_eq!(store.list_allocs_by_job("default", "agent", true).unwrap().len(), 3);
        assert_eq!(store.list_allocs_by_node("n1", false).unwrap().len(), 2);

        store.update_alloc_status("a1", AllocStatus::Failed).unwrap();
        assert_eq!(store.list_allocs_by_job("default", "agent", false).unwrap().len(), 1);
    }

    #[test]
    fn allocs_by_job_excludes_child_job_ids() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_allocs(&[
                test_alloc("default", "agent", "a1", "n1"),
                test_alloc("default", "agent/periodic-1", "c1", "n1"),
                test_alloc("default", "agent/periodic-1", "c2", "n2"),
            ])
            .unwrap();

        let parent = store.list_allocs_by_job("default", "agent", true).unwrap();
        assert_eq!(parent.len(), 1);
        assert_eq!(parent[0].id, "a1");
        assert_eq!(store.list_allocs_by_job("default", "agent/periodic-1", true).unwrap().len(), 2);
    }

    #[test]
    fn get_alloc_follows_id_index() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("n1")).unwrap();
        store
            .put_allocs(&[
                test_alloc("default", "agent", "a1", "n1"),
                test_alloc("prod", "api", "b1", "n1"),
            ])
            .unwrap();

        let found = store.get_alloc("b1").unwrap().unwrap();
        assert_eq!(found.namespace, "prod");
        assert_eq!(found.job_id, "api");
        assert!(store.get_alloc("missing").unwrap().is_none());

        // Allocations created by a committed plan are indexed as well.
        let job = test_job("default", "web");
        let plan = test_plan("default", &job, vec![test_alloc("default", "web", "w1", "n1")], vec![]);
        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Applied(_)));
        assert_eq!(store.get_alloc("w1").unwrap().unwrap().job_id, "web");

        store.update_alloc_status("w1", AllocStatus::Running).unwrap();
        assert_eq!(store.get_alloc("w1").unwrap().unwrap().status, AllocStatus::Running);
        assert!(matches!(
            store.update_alloc_status("missing", AllocStatus::Running),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn eval_round_trip_keeps_create_index() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("default", "agent");
        let eval = Evaluation::for_job("e1", &job, triggers::JOB_REGISTER);

        let created = store.put_evals(std::slice::from_ref(&eval)).unwrap();
        let mut stored = store.get_eval("e1").unwrap().unwrap();
        stored.transition(EvalStatus::Complete, "").unwrap();
        let modified = store.put_evals(&[stored]).unwrap();

        let stored = store.get_eval("e1").unwrap().unwrap();
        assert_eq!(stored.create_index, created);
        assert_eq!(stored.modify_index, modified);
        assert_eq!(stored.status, EvalStatus::Complete);
    }

    // ── Snapshots ──────────────────────────────────────────────────

    #[test]
    fn snapshot_is_point_in_time() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("n1")).unwrap();
        let snap = store.snapshot().unwrap();

        store.put_node(&test_node("n2")).unwrap();

        assert_eq!(snap.nodes().count(), 1);
        assert_eq!(snap.index(), 1);
        assert_eq!(store.snapshot().unwrap().nodes().count(), 2);
        assert_eq!(store.latest_index().unwrap(), 2);
    }

    // ── Plan commit ────────────────────────────────────────────────

    #[test]
    fn commit_applies_placements_and_evictions() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("n1")).unwrap();
        store.put_node(&test_node("n2")).unwrap();
        let job = test_job("default", "agent");
        store.put_job(&job).unwrap();
        store.put_allocs(&[test_alloc("default", "agent", "old", "n2")]).unwrap();

        let mut stop = test_alloc("default", "agent", "old", "n2");
        stop.status = AllocStatus::Evicted;
        stop.status_description = "node is draining".to_string();
        let plan = test_plan("default", &job, vec![test_alloc("default", "agent", "new", "n1")], vec![stop]);

        let PlanOutcome::Applied(result) = store.commit_plan(&plan).unwrap() else {
            panic!("expected plan to apply");
        };
        assert_eq!(result.alloc_index, store.latest_index().unwrap());

        let live = store.list_allocs_by_job("default", "agent", false).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "new");
        assert_eq!(live[0].create_index, result.alloc_index);

        let old = store.get_alloc("old").unwrap().unwrap();
        assert_eq!(old.status, AllocStatus::Evicted);
        assert_eq!(old.status_description, "node is draining");
    }

    #[test]
    fn commit_rejects_duplicate_system_alloc() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("n1")).unwrap();
        let job = test_job("default", "agent");
        store.put_allocs(&[test_alloc("default", "agent", "a1", "n1")]).unwrap();
        let before = store.latest_index().unwrap();

        let plan = test_plan("default", &job, vec![test_alloc("default", "agent", "a2", "n1")], vec![]);
        let outcome = store.commit_plan(&plan).unwrap();

        assert!(matches!(outcome, PlanOutcome::Conflict(ref r) if r.contains("already has an allocation")));
        assert_eq!(store.latest_index().unwrap(), before);
        assert!(store.get_alloc("a2").unwrap().is_none());
    }

    #[test]
    fn commit_rejects_drained_node() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = test_node("n1");
        node.drain = true;
        store.put_node(&node).unwrap();
        let job = test_job("default", "agent");

        let plan = test_plan("default", &job, vec![test_alloc("default", "agent", "a1", "n1")], vec![]);
        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Conflict(_)));
    }

    #[test]
    fn commit_rechecks_quota_against_current_usage() {
        let store = quota_store(512);
        store.put_node(&test_node("n1")).unwrap();
        store.put_node(&test_node("n2")).unwrap();
        store.put_node(&test_node("n3")).unwrap();
        let job = test_job("team", "agent");
        // Another job in the namespace already uses 256 MB.
        store.put_allocs(&[test_alloc("team", "other", "x1", "n3")]).unwrap();

        let plan = test_plan(
            "team",
            &job,
            vec![
                test_alloc("team", "agent", "a1", "n1"),
                test_alloc("team", "agent", "a2", "n2"),
            ],
            vec![],
        );
        let outcome = store.commit_plan(&plan).unwrap();
        assert!(matches!(outcome, PlanOutcome::Conflict(ref r) if r.contains("quota small exceeded on memory")));

        let plan = test_plan("team", &job, vec![test_alloc("team", "agent", "a1", "n1")], vec![]);
        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Applied(_)));
    }

    #[test]
    fn commit_counts_evictions_toward_quota_relief() {
        let store = quota_store(256);
        store.put_node(&test_node("n1")).unwrap();
        store.put_node(&test_node("n2")).unwrap();
        let job = test_job("team", "agent");
        store.put_allocs(&[test_alloc("team", "agent", "old", "n2")]).unwrap();

        let mut stop = test_alloc("team", "agent", "old", "n2");
        stop.status = AllocStatus::Evicted;
        let plan = test_plan("team", &job, vec![test_alloc("team", "agent", "new", "n1")], vec![stop]);

        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Applied(_)));
    }

    #[test]
    fn commit_checks_quota_in_the_plan_region() {
        let store = quota_store(256);
        store.put_node(&test_node("n1")).unwrap();
        store.put_node(&test_node("n2")).unwrap();
        let mut job = test_job("team", "agent");
        job.region = String::new();

        let place = vec![
            test_alloc("team", "agent", "a1", "n1"),
            test_alloc("team", "agent", "a2", "n2"),
        ];
        let mut plan = test_plan("team", &job, place, vec![]);
        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Conflict(ref r) if r.contains("quota small")));

        // An empty plan region falls back to the default region.
        plan.region = String::new();
        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Conflict(_)));

        // A region the quota has no limit for admits.
        plan.region = "eu".to_string();
        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Applied(_)));
    }

    #[test]
    fn commit_rejects_missing_quota_spec() {
        let store = quota_store(1024);
        store.delete_quota_spec("small").unwrap();
        store.put_node(&test_node("n1")).unwrap();
        let job = test_job("team", "agent");

        let plan = test_plan("team", &job, vec![test_alloc("team", "agent", "a1", "n1")], vec![]);
        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Conflict(ref r) if r.contains("not found")));
    }

    #[test]
    fn commit_rejects_node_overcommit() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = test_node("n1");
        node.resources = Resources::new(600, 8192);
        store.put_node(&node).unwrap();
        store.put_allocs(&[test_alloc("default", "other", "x1", "n1")]).unwrap();
        let job = test_job("default", "agent");

        let plan = test_plan("default", &job, vec![test_alloc("default", "agent", "a1", "n1")], vec![]);
        assert!(matches!(store.commit_plan(&plan).unwrap(), PlanOutcome::Conflict(ref r) if r.contains("exhausted cpu")));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_job(&test_job("prod", "agent")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let job = store.get_job("prod", "agent").unwrap();
        assert!(job.is_some());
        assert_eq!(store.latest_index().unwrap(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_jobs().unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_evals().unwrap().is_empty());
        assert!(store.list_allocs_by_job("default", "any", true).unwrap().is_empty());
        assert!(!store.delete_job("default", "nope").unwrap());
        assert!(!store.delete_node("nope").unwrap());
        assert_eq!(store.snapshot().unwrap().index(), 0);
    }
}
