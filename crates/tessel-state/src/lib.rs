//! tessel-state — cluster state for the Tessel scheduler.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for jobs, nodes, allocations, namespaces, quota specs, and
//! evaluations, and hands out point-in-time [`StateSnapshot`]s for the
//! scheduler to read from.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{namespace}/{job_id}`, `{namespace}/{job_id}/{alloc_id}`)
//! enable efficient prefix scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across worker threads. Plans are applied through
//! [`StateStore::commit_plan`], which re-checks quota and placement
//! invariants inside the write transaction that applies them.

pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use snapshot::{SnapshotSource, StateSnapshot};
pub use store::StateStore;
pub use types::*;
