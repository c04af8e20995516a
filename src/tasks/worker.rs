//! Background worker: polls the task queue and runs pipeline stages.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::cache::KeyValueCache;
use crate::config::{StorageConfig, WorkerConfig};
use crate::contribution::{ContributionPipeline, DuplicateStore};
use crate::error::Result;
use crate::merge::{EntityMergeStore, TagMergeStore};
use crate::store::entity::EntityStore;
use crate::store::tag_def::TagDefStore;
use crate::tasks::outbox::PgTaskQueue;
use crate::tasks::Task;

pub struct Worker {
    queue: PgTaskQueue,
    config: WorkerConfig,
    entities: EntityStore,
    tag_defs: TagDefStore,
    pipeline: ContributionPipeline,
    duplicates: DuplicateStore,
    tag_merges: TagMergeStore,
    entity_merges: EntityMergeStore,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        cache: Arc<dyn KeyValueCache>,
        config: WorkerConfig,
        storage: StorageConfig,
    ) -> Self {
        // Handlers enqueue follow-up tasks through the same durable queue.
        let queue = PgTaskQueue::new(pool.clone());
        let queue_arc: Arc<dyn crate::tasks::TaskQueue> = Arc::new(queue.clone());

        Self {
            entities: EntityStore::new(pool.clone(), queue_arc.clone(), cache.clone()),
            tag_defs: TagDefStore::new(pool.clone(), queue_arc.clone(), cache.clone()),
            pipeline: ContributionPipeline::new(
                pool.clone(),
                queue_arc.clone(),
                cache.clone(),
                storage,
            ),
            duplicates: DuplicateStore::new(pool.clone(), queue_arc.clone(), cache.clone()),
            tag_merges: TagMergeStore::new(pool.clone(), queue_arc.clone(), cache.clone()),
            entity_merges: EntityMergeStore::new(pool, queue_arc, cache),
            queue,
            config,
        }
    }

    /// Poll until the future is dropped (the binary races this against a
    /// shutdown signal).
    pub async fn run(&self) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_secs = self.config.poll_interval.as_secs(),
            "worker started"
        );
        loop {
            let processed = self.run_once().await?;
            if processed == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Claim and process one batch. Returns the number of claimed tasks.
    pub async fn run_once(&self) -> Result<usize> {
        let batch = self
            .queue
            .claim_pending(self.config.batch_size, self.config.retry_backoff)
            .await?;
        let claimed = batch.len();

        for outbox_task in batch {
            match self.dispatch(&outbox_task.task).await {
                Ok(()) => self.queue.mark_done(outbox_task.task_id).await?,
                Err(err) => {
                    if outbox_task.attempts >= self.config.max_attempts {
                        error!(
                            task = %outbox_task.task_id,
                            attempts = outbox_task.attempts,
                            error = %err,
                            "task failed permanently"
                        );
                    } else {
                        warn!(
                            task = %outbox_task.task_id,
                            attempts = outbox_task.attempts,
                            error = %err,
                            "task failed, will retry"
                        );
                    }
                    self.queue
                        .mark_failed(
                            outbox_task.task_id,
                            &err.to_string(),
                            self.config.max_attempts,
                        )
                        .await?;
                }
            }
        }
        Ok(claimed)
    }

    async fn dispatch(&self, task: &Task) -> Result<()> {
        match task {
            Task::ExtractColumns { id_contribution } => {
                self.pipeline.extract_columns(*id_contribution).await
            }
            Task::IngestValues { id_contribution } => {
                self.pipeline.ingest_values(*id_contribution).await
            }
            Task::EliminateDuplicates { id_contribution } => {
                self.duplicates.eliminate_duplicates(*id_contribution).await
            }
            Task::FastForwardTagMerge {
                id_request,
                requester,
            } => self.tag_merges.fast_forward(*id_request, requester).await,
            Task::ResolveTagMerge {
                id_request,
                requester,
            } => self.tag_merges.resolve(*id_request, requester).await,
            Task::ApplyEntityMerge {
                id_request,
                requester,
            } => self.entity_merges.apply(*id_request, requester).await,
            Task::RefreshDisplayTxt {
                id_entity_persistent,
            } => self.entities.refresh_display_txt(*id_entity_persistent).await,
            Task::RefreshNamePath {
                id_tag_definition_persistent,
            } => {
                self.tag_defs
                    .refresh_name_path(*id_tag_definition_persistent)
                    .await
            }
        }
    }
}
