//! Entity merge requests.
//!
//! An entity merge folds one entity into another across every tag definition
//! they share. Conflicts are paired by tag definition; resolutions are
//! partitioned for the viewing user into resolvable (write access),
//! unresolvable (no write access) and updated (stale references). Applying a
//! merge never blocks on unresolved conflicts: each one degrades into a
//! hidden child tag definition plus an ordinary tag merge request, so the
//! entity merge always completes and the leftovers are reconciled later.

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
use crate::merge::tag::TagMergeStore;
use crate::merge::{reference_current, MergeRequestState};
use crate::store::entity::{EntityDraft, EntityStore};
use crate::store::tag_def::{TagDefDraft, TagDefRecord, TagDefStore};
use crate::store::tag_instance::{TagInstanceDraft, TagInstanceRecord, TagInstanceStore};
use crate::tasks::{Task, TaskQueue};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EntityMergeRequest {
    pub id_persistent: Uuid,
    pub id_origin_persistent: Uuid,
    pub id_destination_persistent: Uuid,
    pub created_by: String,
    pub state: MergeRequestState,
    pub id_contribution: Option<Uuid>,
    pub error_msg: Option<String>,
    pub error_trace: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A per-tag-definition disagreement between the two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConflict {
    pub definition: TagDefRecord,
    pub origin: TagInstanceRecord,
    pub destination: Option<TagInstanceRecord>,
}

impl EntityConflict {
    pub fn needs_resolution(&self) -> bool {
        match &self.destination {
            Some(dest) => dest.value != self.origin.value,
            None => true,
        }
    }
}

/// A decision for one tag definition, pinned to the versions of everything
/// it was made against: the definition, both entities, and both instances.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EntityConflictResolution {
    pub id: i64,
    pub id_request: Uuid,
    pub id_tag_definition_persistent: Uuid,
    pub tag_definition_version: i64,
    pub origin_entity_version: i64,
    pub destination_entity_version: i64,
    pub origin_instance_version: Option<i64>,
    pub destination_instance_version: Option<i64>,
    pub replace: bool,
    pub created_at: DateTime<Utc>,
}

/// Resolutions grouped by what the viewing user can do with them.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResolutionPartition {
    /// Current references, user has write access to the tag definition.
    pub resolvable: Vec<EntityConflictResolution>,
    /// Current references, but the user may not write this tag.
    pub unresolvable: Vec<EntityConflictResolution>,
    /// A referenced definition, entity or instance was edited since the
    /// resolution was recorded.
    pub updated: Vec<EntityConflictResolution>,
}

const SELECT_REQUEST: &str = r#"
    SELECT id_persistent, id_origin_persistent, id_destination_persistent, created_by,
           state, id_contribution, error_msg, error_trace, created_at
    FROM entity_merge_requests
"#;

#[derive(Clone)]
pub struct EntityMergeStore {
    pool: PgPool,
    queue: Arc<dyn TaskQueue>,
    entities: EntityStore,
    tag_defs: TagDefStore,
    instances: TagInstanceStore,
    tag_merges: TagMergeStore,
}

impl EntityMergeStore {
    pub fn new(pool: PgPool, queue: Arc<dyn TaskQueue>, cache: Arc<dyn KeyValueCache>) -> Self {
        let entities = EntityStore::new(pool.clone(), queue.clone(), cache.clone());
        let tag_defs = TagDefStore::new(pool.clone(), queue.clone(), cache.clone());
        let instances = TagInstanceStore::new(pool.clone(), queue.clone(), cache.clone());
        let tag_merges = TagMergeStore::new(pool.clone(), queue.clone(), cache);
        Self {
            pool,
            queue,
            entities,
            tag_defs,
            instances,
            tag_merges,
        }
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    pub async fn create(
        &self,
        user: &UserRef,
        id_origin: Uuid,
        id_destination: Uuid,
    ) -> Result<EntityMergeRequest> {
        // Both chains must exist before a merge can be proposed.
        self.entities.most_recent(id_origin).await?;
        self.entities.most_recent(id_destination).await?;

        let request = sqlx::query_as::<_, EntityMergeRequest>(
            r#"
            INSERT INTO entity_merge_requests
                (id_persistent, id_origin_persistent, id_destination_persistent, created_by, state)
            VALUES ($1, $2, $3, $4, 'OPEN')
            RETURNING id_persistent, id_origin_persistent, id_destination_persistent, created_by,
                      state, id_contribution, error_msg, error_trace, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(id_origin)
        .bind(id_destination)
        .bind(&user.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(request)
    }

    pub async fn get(&self, id_persistent: Uuid) -> Result<EntityMergeRequest> {
        let row = sqlx::query_as::<_, EntityMergeRequest>(&format!(
            "{SELECT_REQUEST} WHERE id_persistent = $1"
        ))
        .bind(id_persistent)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CurationError::NotFound(format!("entity merge request {id_persistent}")))
    }

    pub async fn list_by_creator(&self, creator: &str) -> Result<Vec<EntityMergeRequest>> {
        let rows = sqlx::query_as::<_, EntityMergeRequest>(&format!(
            "{SELECT_REQUEST} WHERE created_by = $1 ORDER BY created_at ASC"
        ))
        .bind(creator)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------------
    // Conflicts and resolutions
    // ------------------------------------------------------------------------

    /// For every tag instance on the origin entity, the destination's current
    /// value for the same definition, keeping only disagreements.
    pub async fn instance_conflicts_all(&self, id_request: Uuid) -> Result<Vec<EntityConflict>> {
        let request = self.get(id_request).await?;
        let mut conn = self.pool.acquire().await?;
        self.conflicts_tx(&mut conn, &request).await
    }

    async fn conflicts_tx(
        &self,
        conn: &mut PgConnection,
        request: &EntityMergeRequest,
    ) -> Result<Vec<EntityConflict>> {
        let origin = self
            .instances
            .heads_for_entity(conn, request.id_origin_persistent)
            .await?;
        let destination = self
            .instances
            .heads_for_entity(conn, request.id_destination_persistent)
            .await?;
        let dest_by_def: HashMap<Uuid, TagInstanceRecord> = destination
            .into_iter()
            .map(|inst| (inst.id_tag_definition_persistent, inst))
            .collect();

        let mut conflicts = Vec::new();
        for origin_instance in origin {
            let definition = self
                .tag_defs
                .most_recent_tx(conn, origin_instance.id_tag_definition_persistent)
                .await?;
            let conflict = EntityConflict {
                destination: dest_by_def
                    .get(&origin_instance.id_tag_definition_persistent)
                    .cloned(),
                origin: origin_instance,
                definition,
            };
            if conflict.needs_resolution() {
                conflicts.push(conflict);
            }
        }
        Ok(conflicts)
    }

    /// Record (or overwrite) the decision for one tag definition.
    pub async fn record_resolution(
        &self,
        user: &UserRef,
        id_request: Uuid,
        id_tag_definition: Uuid,
        replace: bool,
    ) -> Result<EntityConflictResolution> {
        let request = self.get(id_request).await?;
        let definition = self.tag_defs.most_recent(id_tag_definition).await?;
        if !definition.has_write_access(user) {
            return Err(CurationError::Forbidden(format!(
                "{} may not resolve conflicts for tag {id_tag_definition}",
                user.name
            )));
        }

        let mut conn = self.pool.acquire().await?;
        let conflicts = self.conflicts_tx(&mut conn, &request).await?;
        let conflict = conflicts
            .into_iter()
            .find(|c| c.definition.id_persistent == id_tag_definition)
            .ok_or_else(|| {
                CurationError::NotFound(format!("no open conflict for tag {id_tag_definition}"))
            })?;

        let origin_entity = self.entities.most_recent(request.id_origin_persistent).await?;
        let destination_entity = self
            .entities
            .most_recent(request.id_destination_persistent)
            .await?;

        let resolution = sqlx::query_as::<_, EntityConflictResolution>(
            r#"
            INSERT INTO entity_conflict_resolutions
                (id_request, id_tag_definition_persistent, tag_definition_version,
                 origin_entity_version, destination_entity_version,
                 origin_instance_version, destination_instance_version, replace)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id_request, id_tag_definition_persistent)
            DO UPDATE SET tag_definition_version = $3,
                          origin_entity_version = $4,
                          destination_entity_version = $5,
                          origin_instance_version = $6,
                          destination_instance_version = $7,
                          replace = $8,
                          created_at = now()
            RETURNING id, id_request, id_tag_definition_persistent, tag_definition_version,
                      origin_entity_version, destination_entity_version,
                      origin_instance_version, destination_instance_version, replace, created_at
            "#,
        )
        .bind(id_request)
        .bind(id_tag_definition)
        .bind(conflict.definition.internal_id)
        .bind(origin_entity.internal_id)
        .bind(destination_entity.internal_id)
        .bind(conflict.origin.internal_id)
        .bind(conflict.destination.as_ref().map(|d| d.internal_id))
        .bind(replace)
        .fetch_one(&self.pool)
        .await?;
        Ok(resolution)
    }

    /// Partition stored resolutions for a viewing user.
    pub async fn partition_resolutions(
        &self,
        user: &UserRef,
        id_request: Uuid,
    ) -> Result<ResolutionPartition> {
        let request = self.get(id_request).await?;
        let mut conn = self.pool.acquire().await?;
        let resolutions = self.resolutions(&mut conn, id_request).await?;
        let conflicts = self.conflicts_tx(&mut conn, &request).await?;
        let conflict_by_def: HashMap<Uuid, &EntityConflict> = conflicts
            .iter()
            .map(|c| (c.definition.id_persistent, c))
            .collect();

        let origin_entity = self.entities.most_recent(request.id_origin_persistent).await?;
        let destination_entity = self
            .entities
            .most_recent(request.id_destination_persistent)
            .await?;

        let mut partition = ResolutionPartition::default();
        for resolution in resolutions {
            let current = self
                .resolution_current(
                    &resolution,
                    conflict_by_def.get(&resolution.id_tag_definition_persistent).copied(),
                    origin_entity.internal_id,
                    destination_entity.internal_id,
                )
                .await?;
            if !current {
                partition.updated.push(resolution);
                continue;
            }
            let definition = self
                .tag_defs
                .most_recent(resolution.id_tag_definition_persistent)
                .await?;
            if definition.has_write_access(user) {
                partition.resolvable.push(resolution);
            } else {
                partition.unresolvable.push(resolution);
            }
        }
        Ok(partition)
    }

    /// Staleness test: every referenced version must still be the head of
    /// its chain, including the tag definition and both entities.
    async fn resolution_current(
        &self,
        resolution: &EntityConflictResolution,
        conflict: Option<&EntityConflict>,
        origin_entity_head: i64,
        destination_entity_head: i64,
    ) -> Result<bool> {
        let definition = self
            .tag_defs
            .most_recent(resolution.id_tag_definition_persistent)
            .await?;

        if !reference_current(Some(resolution.tag_definition_version), Some(definition.internal_id))
            || !reference_current(Some(resolution.origin_entity_version), Some(origin_entity_head))
            || !reference_current(
                Some(resolution.destination_entity_version),
                Some(destination_entity_head),
            )
        {
            return Ok(false);
        }

        let (origin_head, destination_head) = match conflict {
            Some(conflict) => (
                Some(conflict.origin.internal_id),
                conflict.destination.as_ref().map(|d| d.internal_id),
            ),
            // The conflict disappeared entirely (for example the origin
            // instance was deleted or now agrees): the resolution no longer
            // refers to current data.
            None => return Ok(false),
        };

        Ok(reference_current(resolution.origin_instance_version, origin_head)
            && reference_current(resolution.destination_instance_version, destination_head))
    }

    async fn resolutions(
        &self,
        conn: &mut PgConnection,
        id_request: Uuid,
    ) -> Result<Vec<EntityConflictResolution>> {
        let rows = sqlx::query_as::<_, EntityConflictResolution>(
            r#"
            SELECT id, id_request, id_tag_definition_persistent, tag_definition_version,
                   origin_entity_version, destination_entity_version,
                   origin_instance_version, destination_instance_version, replace, created_at
            FROM entity_conflict_resolutions
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

    /// Invert the request's direction, simultaneously inverting every stored
    /// resolution so decisions keep their meaning.
    pub async fn swap_origin_destination(&self, user: &UserRef, id_request: Uuid) -> Result<()> {
        let request = self.get(id_request).await?;
        if request.created_by != user.name && !user.permission_group.is_elevated() {
            return Err(CurationError::Forbidden(format!(
                "{} may not modify entity merge request {id_request}",
                user.name
            )));
        }
        if !matches!(
            request.state,
            MergeRequestState::Open | MergeRequestState::Conflicts
        ) {
            return Err(CurationError::InvalidState {
                state: request.state.as_str().to_string(),
                operation: "swap origin and destination",
            });
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE entity_merge_requests
            SET id_origin_persistent = id_destination_persistent,
                id_destination_persistent = id_origin_persistent
            WHERE id_persistent = $1
            "#,
        )
        .bind(id_request)
        .execute(tx.as_mut())
        .await?;

        sqlx::query(
            r#"
            UPDATE entity_conflict_resolutions
            SET replace = NOT replace,
                origin_entity_version = destination_entity_version,
                destination_entity_version = origin_entity_version,
                origin_instance_version = destination_instance_version,
                destination_instance_version = origin_instance_version
            WHERE id_request = $1
            "#,
        )
        .bind(id_request)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// User action: hand the request to the apply stage.
    pub async fn set_resolved(&self, user: &UserRef, id_request: Uuid) -> Result<()> {
        let request = self.get(id_request).await?;
        let updated = sqlx::query(
            "UPDATE entity_merge_requests SET state = 'RESOLVED' WHERE id_persistent = $1 AND state IN ('OPEN', 'CONFLICTS')",
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
            .enqueue(Task::ApplyEntityMerge {
                id_request,
                requester: user.clone(),
            })
            .await?;
        Ok(())
    }

    /// Background stage: apply current resolutions, degrade everything else
    /// into hidden child tags plus tag merge requests, disable the origin.
    pub async fn apply(&self, id_request: Uuid, requester: &UserRef) -> Result<()> {
        match self.apply_inner(id_request, requester).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_error(id_request, &err).await;
                Err(err)
            }
        }
    }

    async fn apply_inner(&self, id_request: Uuid, requester: &UserRef) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(request) = self
            .claim(tx.as_mut(), id_request, MergeRequestState::Resolved)
            .await?
        else {
            return Ok(());
        };

        let origin_entity = self.entities.most_recent(request.id_origin_persistent).await?;
        let destination_entity = self
            .entities
            .most_recent(request.id_destination_persistent)
            .await?;

        let conflicts = self.conflicts_tx(tx.as_mut(), &request).await?;
        let conflict_by_def: HashMap<Uuid, &EntityConflict> = conflicts
            .iter()
            .map(|c| (c.definition.id_persistent, c))
            .collect();
        let resolutions = self.resolutions(tx.as_mut(), id_request).await?;
        let mut resolution_by_def: HashMap<Uuid, EntityConflictResolution> = HashMap::new();
        for resolution in resolutions {
            let current = self
                .resolution_current(
                    &resolution,
                    conflict_by_def.get(&resolution.id_tag_definition_persistent).copied(),
                    origin_entity.internal_id,
                    destination_entity.internal_id,
                )
                .await?;
            if current {
                resolution_by_def.insert(resolution.id_tag_definition_persistent, resolution);
            }
        }

        let mut spawned_requests = Vec::new();
        let mut child_defs: HashMap<Uuid, Uuid> = HashMap::new();

        for conflict in &conflicts {
            let id_definition = conflict.definition.id_persistent;
            match resolution_by_def.get(&id_definition) {
                Some(resolution) => {
                    // An explicit replace=false is an affirmative "keep the
                    // destination": it neither writes nor degrades.
                    if resolution.replace {
                        let draft = TagInstanceDraft {
                            id_entity_persistent: request.id_destination_persistent,
                            id_tag_definition_persistent: id_definition,
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
                    }
                }
                None => {
                    // No current decision: degrade into a hidden child tag
                    // plus a tag merge request for later reconciliation.
                    let id_child = match child_defs.get(&id_definition) {
                        Some(id) => *id,
                        None => {
                            let id_child = Uuid::new_v4();
                            let draft = TagDefDraft {
                                name: format!(
                                    "{} Merge Request {}",
                                    conflict.definition.name, request.id_persistent
                                ),
                                id_parent_persistent: Some(id_definition),
                                tag_type: conflict.definition.tag_type,
                                owner: Some(requester.name.clone()),
                                curated: false,
                                hidden: true,
                                disabled: false,
                            };
                            self.tag_defs
                                .create_child_tx(tx.as_mut(), id_child, &draft)
                                .await?;
                            let spawned = self
                                .tag_merges
                                .create_tx(
                                    tx.as_mut(),
                                    &requester.name,
                                    conflict.definition.owner.as_deref(),
                                    id_child,
                                    id_definition,
                                    None,
                                    true,
                                )
                                .await?;
                            spawned_requests.push(spawned.id_persistent);
                            child_defs.insert(id_definition, id_child);
                            id_child
                        }
                    };
                    let draft = TagInstanceDraft {
                        id_entity_persistent: request.id_destination_persistent,
                        id_tag_definition_persistent: id_child,
                        value: conflict.origin.value.clone(),
                    };
                    self.instances
                        .change_or_create_tx(tx.as_mut(), Uuid::new_v4(), None, &draft)
                        .await?;
                }
            }
        }

        // The origin chain survives, disabled, so history stays walkable.
        let disabled_draft = EntityDraft {
            disabled: true,
            ..EntityDraft::from_record(&origin_entity)
        };
        self.entities
            .change_or_create_tx(
                tx.as_mut(),
                request.id_origin_persistent,
                Some(origin_entity.internal_id),
                &disabled_draft,
            )
            .await?;

        self.set_state(tx.as_mut(), id_request, MergeRequestState::Merged)
            .await?;
        tx.commit().await?;

        info!(
            request = %id_request,
            conflicts = conflicts.len(),
            spawned = spawned_requests.len(),
            "entity merge applied"
        );
        self.queue
            .enqueue(Task::RefreshDisplayTxt {
                id_entity_persistent: request.id_destination_persistent,
            })
            .await?;
        for id_spawned in spawned_requests {
            self.queue
                .enqueue(Task::FastForwardTagMerge {
                    id_request: id_spawned,
                    requester: requester.clone(),
                })
                .await?;
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
    ) -> Result<Option<EntityMergeRequest>> {
        let row = sqlx::query_as::<_, EntityMergeRequest>(&format!(
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
            "UPDATE entity_merge_requests SET state = $2, error_msg = NULL, error_trace = NULL WHERE id_persistent = $1",
        )
        .bind(id_request)
        .bind(state)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn record_error(&self, id_request: Uuid, err: &CurationError) {
        let result = sqlx::query(
            "UPDATE entity_merge_requests SET state = 'ERROR', error_msg = $2, error_trace = $3 WHERE id_persistent = $1",
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
