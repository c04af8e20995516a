//! Tag merge requests.
//!
//! A tag merge request proposes folding the instances of an origin tag
//! definition into a destination definition. Fast-forward runs automatically
//! on creation: with an empty destination the origin instances are copied
//! over and the request merges; otherwise it parks in `Conflicts` for human
//! resolution. Every stage claims the request row `FOR UPDATE SKIP LOCKED`
//! and silently no-ops when another worker holds it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::UserRef;
use crate::cache::KeyValueCache;
use crate::error::{CurationError, Result};
use crate::merge::{needs_resolution, pair_instances, reference_current, MergeRequestState};
use crate::store::tag_def::{TagDefDraft, TagDefStore};
use crate::store::tag_instance::{TagInstanceDraft, TagInstanceRecord, TagInstanceStore};
use crate::tasks::{Task, TaskQueue};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TagMergeRequest {
    pub id_persistent: Uuid,
    pub id_origin_persistent: Uuid,
    pub id_destination_persistent: Uuid,
    pub created_by: String,
    pub assigned_to: Option<String>,
    pub state: MergeRequestState,
    pub id_contribution: Option<Uuid>,
    pub disable_origin_on_merge: bool,
    pub error_msg: Option<String>,
    pub error_trace: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One entity-paired conflict between origin and destination instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConflict {
    pub id_entity_persistent: Uuid,
    pub origin: TagInstanceRecord,
    pub destination: Option<TagInstanceRecord>,
}

impl TagConflict {
    pub fn needs_resolution(&self) -> bool {
        needs_resolution(&self.origin, self.destination.as_ref())
    }
}

/// A human decision for one conflict, keyed by the exact instance versions it
/// was made against.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TagConflictResolution {
    pub id: i64,
    pub id_request: Uuid,
    pub id_entity_persistent: Uuid,
    pub origin_instance_version: Option<i64>,
    pub destination_instance_version: Option<i64>,
    pub replace: bool,
    pub created_at: DateTime<Utc>,
}

const SELECT_REQUEST: &str = r#"
    SELECT id_persistent, id_origin_persistent, id_destination_persistent, created_by,
           assigned_to, state, id_contribution, disable_origin_on_merge,
           error_msg, error_trace, created_at
    FROM tag_merge_requests
"#;

#[derive(Clone)]
pub struct TagMergeStore {
    pool: PgPool,
    queue: Arc<dyn TaskQueue>,
    tag_defs: TagDefStore,
    instances: TagInstanceStore,
}

impl TagMergeStore {
    pub fn new(pool: PgPool, queue: Arc<dyn TaskQueue>, cache: Arc<dyn KeyValueCache>) -> Self {
        let tag_defs = TagDefStore::new(pool.clone(), queue.clone(), cache.clone());
        let instances = TagInstanceStore::new(pool.clone(), queue.clone(), cache);
        Self {
            pool,
            queue,
            tag_defs,
            instances,
        }
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    /// Open a request and schedule its automatic fast-forward.
    pub async fn create(
        &self,
        user: &UserRef,
        id_origin: Uuid,
        id_destination: Uuid,
    ) -> Result<TagMergeRequest> {
        let destination = self.tag_defs.most_recent(id_destination).await?;
        // Unowned curated tags have no assignee.
        let assigned_to = destination.owner.clone();

        let mut conn = self.pool.acquire().await?;
        let request = self
            .create_tx(
                &mut conn,
                &user.name,
                assigned_to.as_deref(),
                id_origin,
                id_destination,
                None,
                false,
            )
            .await?;

        self.queue
            .enqueue(Task::FastForwardTagMerge {
                id_request: request.id_persistent,
                requester: user.clone(),
            })
            .await?;
        Ok(request)
    }

    /// Insert a request inside a caller-held transaction. The caller decides
    /// when (and whether) fast-forward is scheduled: contribution-owned
    /// requests wait until duplicate elimination has rewritten instances.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn create_tx(
        &self,
        conn: &mut PgConnection,
        created_by: &str,
        assigned_to: Option<&str>,
        id_origin: Uuid,
        id_destination: Uuid,
        id_contribution: Option<Uuid>,
        disable_origin_on_merge: bool,
    ) -> Result<TagMergeRequest> {
        let request = sqlx::query_as::<_, TagMergeRequest>(
            r#"
            INSERT INTO tag_merge_requests
                (id_persistent, id_origin_persistent, id_destination_persistent,
                 created_by, assigned_to, state, id_contribution, disable_origin_on_merge)
            VALUES ($1, $2, $3, $4, $5, 'OPEN', $6, $7)
            RETURNING id_persistent, id_origin_persistent, id_destination_persistent, created_by,
                      assigned_to, state, id_contribution, disable_origin_on_merge,
                      error_msg, error_trace, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(id_origin)
        .bind(id_destination)
        .bind(created_by)
        .bind(assigned_to)
        .bind(id_contribution)
        .bind(disable_origin_on_merge)
        .fetch_one(conn)
        .await?;
        Ok(request)
    }

    pub async fn get(&self, id_persistent: Uuid) -> Result<TagMergeRequest> {
        let row = sqlx::query_as::<_, TagMergeRequest>(&format!(
            "{SELECT_REQUEST} WHERE id_persistent = $1"
        ))
        .bind(id_persistent)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CurationError::NotFound(format!("tag merge request {id_persistent}")))
    }

    pub async fn list_by_assignee(&self, assignee: &str) -> Result<Vec<TagMergeRequest>> {
        let rows = sqlx::query_as::<_, TagMergeRequest>(&format!(
            "{SELECT_REQUEST} WHERE assigned_to = $1 ORDER BY created_at ASC"
        ))
        .bind(assignee)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub(crate) async fn ids_for_contribution(
        &self,
        conn: &mut PgConnection,
        id_contribution: Uuid,
    ) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id_persistent FROM tag_merge_requests WHERE id_contribution = $1",
        )
        .bind(id_contribution)
        .fetch_all(conn)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ------------------------------------------------------------------------
    // Conflicts and resolutions
    // ------------------------------------------------------------------------

    /// Entity-paired conflicts between origin and destination instance sets.
    pub async fn conflicts(&self, id_request: Uuid) -> Result<Vec<TagConflict>> {
        let request = self.get(id_request).await?;
        let mut conn = self.pool.acquire().await?;
        self.conflicts_tx(&mut conn, &request).await
    }

    async fn conflicts_tx(
        &self,
        conn: &mut PgConnection,
        request: &TagMergeRequest,
    ) -> Result<Vec<TagConflict>> {
        let origin_ids = self
            .tag_defs
            .self_and_descendant_ids(request.id_origin_persistent)
            .await?;
        // The origin is often a hidden child of the destination; its subtree
        // must not count as destination data.
        let destination_ids: Vec<Uuid> = self
            .tag_defs
            .self_and_descendant_ids(request.id_destination_persistent)
            .await?
            .into_iter()
            .filter(|id| !origin_ids.contains(id))
            .collect();

        let origin = self.instances.heads_for_definition_set(conn, &origin_ids).await?;
        let destination = self
            .instances
            .heads_for_definition_set(conn, &destination_ids)
            .await?;

        Ok(pair_instances(&origin, &destination)
            .into_iter()
            .map(|(origin, destination)| TagConflict {
                id_entity_persistent: origin.id_entity_persistent,
                origin,
                destination,
            })
            .filter(TagConflict::needs_resolution)
            .collect())
    }

    /// Record (or overwrite) the decision for one conflicting entity. The
    /// stored version references pin the decision to the rows the user saw.
    pub async fn record_resolution(
        &self,
        user: &UserRef,
        id_request: Uuid,
        id_entity: Uuid,
        replace: bool,
    ) -> Result<TagConflictResolution> {
        let request = self.get(id_request).await?;
        let destination = self
            .tag_defs
            .most_recent(request.id_destination_persistent)
            .await?;
        if !destination.has_write_access(user) {
            return Err(CurationError::Forbidden(format!(
                "{} may not resolve conflicts for tag {}",
                user.name, request.id_destination_persistent
            )));
        }

        let mut conn = self.pool.acquire().await?;
        let conflicts = self.conflicts_tx(&mut conn, &request).await?;
        let conflict = conflicts
            .into_iter()
            .find(|c| c.id_entity_persistent == id_entity)
            .ok_or_else(|| {
                CurationError::NotFound(format!("no open conflict for entity {id_entity}"))
            })?;

        let resolution = sqlx::query_as::<_, TagConflictResolution>(
            r#"
            INSERT INTO tag_conflict_resolutions
                (id_request, id_entity_persistent, origin_instance_version,
                 destination_instance_version, replace)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id_request, id_entity_persistent)
            DO UPDATE SET origin_instance_version = $3,
                          destination_instance_version = $4,
                          replace = $5,
                          created_at = now()
            RETURNING id, id_request, id_entity_persistent, origin_instance_version,
                      destination_instance_version, replace, created_at
            "#,
        )
        .bind(id_request)
        .bind(id_entity)
        .bind(conflict.origin.internal_id)
        .bind(conflict.destination.as_ref().map(|d| d.internal_id))
        .bind(replace)
        .fetch_one(&self.pool)
        .await?;
        Ok(resolution)
    }

    async fn resolutions(
        &self,
        conn: &mut PgConnection,
        id_request: Uuid,
    ) -> Result<Vec<TagConflictResolution>> {
        let rows = sqlx::query_as::<_, TagConflictResolution>(
            r#"
            SELECT id, id_request, id_entity_persistent, origin_instance_version,
                   destination_instance_version, replace, created_at
            FROM tag_conflict_resolutions
            WHERE id_request = $1
            "#,
        )
        .bind(id_request)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    /// User action: hand the request to the resolve stage.
    pub async fn set_resolved(&self, user: &UserRef, id_request: Uuid) -> Result<()> {
        let request = self.get(id_request).await?;
        let destination = self
            .tag_defs
            .most_recent(request.id_destination_persistent)
            .await?;
        if !destination.has_write_access(user) {
            return Err(CurationError::Forbidden(format!(
                "{} may not resolve tag merge request {id_request}",
                user.name
            )));
        }

        let updated = sqlx::query(
            "UPDATE tag_merge_requests SET state = 'RESOLVED' WHERE id_persistent = $1 AND state = 'CONFLICTS'",
        )
        .bind(id_request)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(CurationError::InvalidState {
                state: request.state.as_str().to_string(),
                operation: "resolve",
            });
        }

        self.queue
            .enqueue(Task::ResolveTagMerge {
                id_request,
                requester: user.clone(),
            })
            .await?;
        Ok(())
    }

    /// Abandon an open or conflicted request.
    pub async fn close(&self, user: &UserRef, id_request: Uuid) -> Result<()> {
        let request = self.get(id_request).await?;
        let permitted = request.created_by == user.name
            || request.assigned_to.as_deref() == Some(user.name.as_str())
            || user.permission_group.is_elevated();
        if !permitted {
            return Err(CurationError::Forbidden(format!(
                "{} may not close tag merge request {id_request}",
                user.name
            )));
        }

        let updated = sqlx::query(
            "UPDATE tag_merge_requests SET state = 'CLOSED' WHERE id_persistent = $1 AND state IN ('OPEN', 'CONFLICTS')",
        )
        .bind(id_request)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            if let Some(id_contribution) = request.id_contribution {
                self.refresh_contribution_state(id_contribution).await?;
            }
        }
        Ok(())
    }

    /// Contribution-owned requests gate their contribution's completion: the
    /// contribution flips to MERGED once the last of them reaches a terminal
    /// state, however long after elimination that happens.
    pub(crate) async fn refresh_contribution_state(&self, id_contribution: Uuid) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE contributions
            SET state = 'MERGED'
            WHERE id_persistent = $1
              AND state = 'VALUES_ASSIGNED'
              AND NOT EXISTS (
                  SELECT 1 FROM tag_merge_requests
                  WHERE id_contribution = $1
                    AND state NOT IN ('MERGED', 'CLOSED')
              )
            "#,
        )
        .bind(id_contribution)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            info!(contribution = %id_contribution, "contribution merged");
        }
        Ok(())
    }

    /// Background stage: copy origin instances into an empty destination, or
    /// park the request in `Conflicts`.
    pub async fn fast_forward(&self, id_request: Uuid, requester: &UserRef) -> Result<()> {
        match self.fast_forward_inner(id_request, requester).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_error(id_request, &err).await;
                Err(err)
            }
        }
    }

    async fn fast_forward_inner(&self, id_request: Uuid, requester: &UserRef) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(request) = self
            .claim(tx.as_mut(), id_request, MergeRequestState::Open)
            .await?
        else {
            return Ok(());
        };

        let destination = self
            .tag_defs
            .most_recent_tx(tx.as_mut(), request.id_destination_persistent)
            .await?;
        if !destination.has_write_access(requester) {
            // Not an error, and no state change either: the request stays
            // open until someone with write access re-triggers it.
            tx.commit().await?;
            warn!(request = %id_request, user = %requester.name, "fast-forward skipped: no write access");
            return Ok(());
        }

        let origin_ids = self
            .tag_defs
            .self_and_descendant_ids(request.id_origin_persistent)
            .await?;
        let destination_ids: Vec<Uuid> = self
            .tag_defs
            .self_and_descendant_ids(request.id_destination_persistent)
            .await?
            .into_iter()
            .filter(|id| !origin_ids.contains(id))
            .collect();
        let destination_instances = self
            .instances
            .heads_for_definition_set(tx.as_mut(), &destination_ids)
            .await?;

        if !destination_instances.is_empty() {
            self.set_state(tx.as_mut(), id_request, MergeRequestState::Conflicts)
                .await?;
            tx.commit().await?;
            info!(request = %id_request, "tag merge has conflicts");
            return Ok(());
        }

        let origin_instances = self
            .instances
            .heads_for_definition_set(tx.as_mut(), &origin_ids)
            .await?;

        let mut touched_entities = Vec::with_capacity(origin_instances.len());
        for instance in &origin_instances {
            let draft = TagInstanceDraft {
                id_entity_persistent: instance.id_entity_persistent,
                id_tag_definition_persistent: request.id_destination_persistent,
                value: instance.value.clone(),
            };
            self.instances
                .change_or_create_tx(tx.as_mut(), Uuid::new_v4(), None, &draft)
                .await?;
            touched_entities.push(instance.id_entity_persistent);
        }

        if request.disable_origin_on_merge {
            self.disable_origin(tx.as_mut(), request.id_origin_persistent).await?;
        }
        self.set_state(tx.as_mut(), id_request, MergeRequestState::Merged)
            .await?;
        tx.commit().await?;

        info!(
            request = %id_request,
            copied = touched_entities.len(),
            "tag merge fast-forwarded"
        );
        for id_entity in touched_entities {
            self.queue
                .enqueue(Task::RefreshDisplayTxt {
                    id_entity_persistent: id_entity,
                })
                .await?;
        }
        if let Some(id_contribution) = request.id_contribution {
            self.refresh_contribution_state(id_contribution).await?;
        }
        Ok(())
    }

    /// Background stage: apply recorded resolutions. Reverts to `Open` when
    /// any conflict is unresolved or any resolution went stale.
    pub async fn resolve(&self, id_request: Uuid, requester: &UserRef) -> Result<()> {
        match self.resolve_inner(id_request, requester).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_error(id_request, &err).await;
                Err(err)
            }
        }
    }

    async fn resolve_inner(&self, id_request: Uuid, requester: &UserRef) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(request) = self
            .claim(tx.as_mut(), id_request, MergeRequestState::Resolved)
            .await?
        else {
            return Ok(());
        };

        let destination = self
            .tag_defs
            .most_recent_tx(tx.as_mut(), request.id_destination_persistent)
            .await?;
        if !destination.has_write_access(requester) {
            return Err(CurationError::Forbidden(format!(
                "{} may not apply tag merge request {id_request}",
                requester.name
            )));
        }

        let conflicts = self.conflicts_tx(tx.as_mut(), &request).await?;
        let resolutions = self.resolutions(tx.as_mut(), id_request).await?;
        let by_entity: HashMap<Uuid, &TagConflictResolution> = resolutions
            .iter()
            .map(|r| (r.id_entity_persistent, r))
            .collect();

        let all_current = conflicts.iter().all(|conflict| {
            by_entity
                .get(&conflict.id_entity_persistent)
                .map(|resolution| {
                    reference_current(
                        resolution.origin_instance_version,
                        Some(conflict.origin.internal_id),
                    ) && reference_current(
                        resolution.destination_instance_version,
                        conflict.destination.as_ref().map(|d| d.internal_id),
                    )
                })
                .unwrap_or(false)
        });

        if !all_current {
            self.set_state(tx.as_mut(), id_request, MergeRequestState::Open)
                .await?;
            tx.commit().await?;
            info!(request = %id_request, "stale or missing resolutions; request reopened");
            return Ok(());
        }

        let mut touched_entities = Vec::new();
        for conflict in &conflicts {
            let resolution = by_entity
                .get(&conflict.id_entity_persistent)
                .ok_or_else(|| {
                    CurationError::NotFound(format!(
                        "resolution for entity {}",
                        conflict.id_entity_persistent
                    ))
                })?;
            if !resolution.replace {
                continue;
            }
            let draft = TagInstanceDraft {
                id_entity_persistent: conflict.id_entity_persistent,
                id_tag_definition_persistent: request.id_destination_persistent,
                value: conflict.origin.value.clone(),
            };
            match &conflict.destination {
                Some(dest) => {
                    self.instances
                        .change_or_create_tx(
                            tx.as_mut(),
                            dest.id_persistent,
                            Some(dest.internal_id),
                            &draft,
                        )
                        .await?;
                }
                None => {
                    self.instances
                        .change_or_create_tx(tx.as_mut(), Uuid::new_v4(), None, &draft)
                        .await?;
                }
            }
            touched_entities.push(conflict.id_entity_persistent);
        }

        if request.disable_origin_on_merge {
            self.disable_origin(tx.as_mut(), request.id_origin_persistent).await?;
        }
        self.set_state(tx.as_mut(), id_request, MergeRequestState::Merged)
            .await?;
        tx.commit().await?;

        info!(request = %id_request, applied = touched_entities.len(), "tag merge resolved");
        for id_entity in touched_entities {
            self.queue
                .enqueue(Task::RefreshDisplayTxt {
                    id_entity_persistent: id_entity,
                })
                .await?;
        }
        if let Some(id_contribution) = request.id_contribution {
            self.refresh_contribution_state(id_contribution).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn claim(
        &self,
        conn: &mut PgConnection,
        id_request: Uuid,
        expected_state: MergeRequestState,
    ) -> Result<Option<TagMergeRequest>> {
        let row = sqlx::query_as::<_, TagMergeRequest>(&format!(
            "{SELECT_REQUEST} WHERE id_persistent = $1 AND state = $2 FOR UPDATE SKIP LOCKED"
        ))
        .bind(id_request)
        .bind(expected_state)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    async fn set_state(
        &self,
        conn: &mut PgConnection,
        id_request: Uuid,
        state: MergeRequestState,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tag_merge_requests SET state = $2, error_msg = NULL, error_trace = NULL WHERE id_persistent = $1",
        )
        .bind(id_request)
        .bind(state)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn disable_origin(&self, conn: &mut PgConnection, id_origin: Uuid) -> Result<()> {
        let head = self.tag_defs.most_recent_tx(conn, id_origin).await?;
        let draft = TagDefDraft {
            disabled: true,
            ..TagDefDraft::from_record(&head)
        };
        self.tag_defs
            .change_or_create_tx(conn, id_origin, Some(head.internal_id), &draft)
            .await?;
        Ok(())
    }

    async fn record_error(&self, id_request: Uuid, err: &CurationError) {
        let result = sqlx::query(
            "UPDATE tag_merge_requests SET state = 'ERROR', error_msg = $2, error_trace = $3 WHERE id_persistent = $1",
        )
        .bind(id_request)
        .bind(err.pipeline_msg())
        .bind(err.pipeline_trace())
        .execute(&self.pool)
        .await;
        if let Err(db_err) = result {
            warn!(request = %id_request, error = %db_err, "failed to record merge error");
        }
    }
}
