//! Background worker binary: runs migrations, then polls the task queue
//! until interrupted.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tagmere::cache::MemoryCache;
use tagmere::config::Config;
use tagmere::db;
use tagmere::error::Result;
use tagmere::tasks::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let pool = db::connect(&config.database).await?;
    db::run_migrations(&pool).await?;

    let cache = Arc::new(MemoryCache::new());
    let worker = Worker::new(pool, cache, config.worker, config.storage);

    tokio::select! {
        result = worker.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
