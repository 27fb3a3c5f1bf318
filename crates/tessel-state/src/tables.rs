//! redb table definitions for the Tessel state store.
//!
//! Each record table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). Composite keys follow the pattern `{namespace}/{id}` so
//! that related records sit next to each other in key order.

use redb::TableDefinition;

/// Jobs keyed by `{namespace}/{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Allocations keyed by `{namespace}/{job_id}/{alloc_id}`.
pub const ALLOCS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocs");

/// Allocation ID to its [`ALLOCS`] key.
pub const ALLOC_KEYS: TableDefinition<&str, &str> = TableDefinition::new("alloc_keys");

/// Namespaces keyed by `{name}`.
pub const NAMESPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("namespaces");

/// Quota specs keyed by `{name}`.
pub const QUOTAS: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");

/// Evaluations keyed by `{eval_id}`.
pub const EVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("evals");

/// Store metadata (the monotonically increasing write index).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the latest write index in [`META`].
pub const LATEST_INDEX: &str = "latest_index";

/// Shape shared by every JSON record table.
pub type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;
