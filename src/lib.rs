//! Core of a collaborative tag/entity curation platform.
//!
//! Everything mutable is an append-only version chain with optimistic
//! concurrency (`change_or_create`). On top of that sit the CSV contribution
//! pipeline, the two-flavor merge engine (tag- and entity-level), duplicate
//! matching, and the ownership/curation policy for tag definitions.
//! Long-running work runs through a durable Postgres-backed task queue
//! consumed by [`tasks::Worker`].

pub mod access;
pub mod cache;
pub mod config;
pub mod contribution;
pub mod db;
pub mod error;
pub mod merge;
pub mod store;
pub mod tasks;
pub mod versioned;

pub use access::{PermissionGroup, UserRef};
pub use cache::{KeyValueCache, MemoryCache};
pub use config::Config;
pub use contribution::{
    ColumnTarget, Contribution, ContributionPipeline, ContributionState, ContributionStore,
    DuplicateStore,
};
pub use error::{CurationError, Result};
pub use merge::{EntityMergeStore, MergeRequestState, TagMergeStore};
pub use store::{EntityStore, OwnershipStore, TagDefStore, TagInstanceStore, TagType};
pub use tasks::{PgTaskQueue, Task, TaskQueue, Worker};
