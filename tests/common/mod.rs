//! Shared fixtures for the database-backed integration tests.
//!
//! All tests in this suite are `#[ignore]`d by default and require a running
//! Postgres with `DATABASE_URL` set; migrations are applied on first use.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::OnceCell;
use uuid::Uuid;

use tagmere::cache::{KeyValueCache, MemoryCache};
use tagmere::tasks::{NullQueue, TaskQueue};

// Each test gets its own pool (leaked for the `'static` borrow): a pool
// shared across `#[tokio::test]` runtimes loses its connections when the
// runtime that opened them shuts down, surfacing as spurious PoolTimedOut.
static MIGRATED: OnceCell<()> = OnceCell::const_new();

pub async fn get_shared_pool() -> &'static PgPool {
    let url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let pool = PgPool::connect(&url)
        .await
        .expect("failed to connect to test database");
    MIGRATED
        .get_or_init(|| async {
            tagmere::db::run_migrations(&pool)
                .await
                .expect("failed to run migrations");
        })
        .await;
    Box::leak(Box::new(pool))
}

/// Queue that drops tasks; tests drive stages directly for determinism.
pub fn null_queue() -> Arc<dyn TaskQueue> {
    Arc::new(NullQueue)
}

pub fn memory_cache() -> Arc<dyn KeyValueCache> {
    Arc::new(MemoryCache::new())
}

/// Unique name so repeated runs against the same database never collide on
/// sibling-name uniqueness.
pub fn unique(prefix: &str) -> String {
    format!("{prefix} {}", Uuid::new_v4())
}
