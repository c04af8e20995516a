//! Entity store.
//!
//! Entities are version-chained records carrying an optional display text and
//! an optional link to the contribution they came from (cleared once the
//! entity is fully accepted). The human-readable label for an entity is
//! resolved lazily: its own `display_txt` if set, otherwise the value of the
//! first matching tag instance along the administrator-configured display
//! order, otherwise the persistent id. Resolution results are cached and
//! recomputed by a background task.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::cache::KeyValueCache;
use crate::error::{CurationError, Result};
use crate::store::tag_def::TagDefStore;
use crate::tasks::{Task, TaskQueue};
use crate::versioned::{VersionRow, VersionedStore};

/// One version row of an entity.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct EntityRecord {
    pub internal_id: i64,
    pub id_persistent: Uuid,
    pub previous_version: Option<i64>,
    pub display_txt: Option<String>,
    pub disabled: bool,
    pub id_contribution: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl VersionRow for EntityRecord {
    fn internal_id(&self) -> i64 {
        self.internal_id
    }
    fn id_persistent(&self) -> Uuid {
        self.id_persistent
    }
    fn previous_version(&self) -> Option<i64> {
        self.previous_version
    }
}

/// Payload for a new entity version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityDraft {
    pub display_txt: Option<String>,
    pub disabled: bool,
    pub id_contribution: Option<Uuid>,
}

impl EntityDraft {
    /// Draft carrying the head's payload forward unchanged.
    pub fn from_record(record: &EntityRecord) -> Self {
        Self {
            display_txt: record.display_txt.clone(),
            disabled: record.disabled,
            id_contribution: record.id_contribution,
        }
    }
}

/// Where a resolved display text came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DisplayTxtSource {
    /// The entity's own `display_txt` field.
    DisplayTxt,
    /// Fallback to the persistent id.
    IdPersistent,
    /// The first matching curated tag definition along the display order.
    TagDefinition {
        id_persistent: Uuid,
        name_path: Vec<String>,
    },
}

/// Resolved display text plus its provenance marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayTxtInfo {
    pub display_txt: String,
    #[serde(flatten)]
    pub source: DisplayTxtSource,
}

pub(crate) fn display_txt_cache_key(id_persistent: Uuid) -> String {
    format!("display_txt:{id_persistent}")
}

/// Store for entity version chains.
#[derive(Clone)]
pub struct EntityStore {
    pool: PgPool,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn KeyValueCache>,
    tag_defs: TagDefStore,
}

const ENTITY_COLUMNS: &str =
    "internal_id, id_persistent, previous_version, display_txt, disabled, id_contribution, created_at";

#[async_trait]
impl VersionedStore for EntityStore {
    type Row = EntityRecord;
    type Draft = EntityDraft;

    async fn head_for_update(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
    ) -> Result<Option<EntityRecord>> {
        let row = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT internal_id, id_persistent, previous_version, display_txt,
                   disabled, id_contribution, created_at
            FROM entities
            WHERE id_persistent = $1
            ORDER BY internal_id DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(id_persistent)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    async fn append(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        previous_version: Option<i64>,
        draft: &EntityDraft,
    ) -> Result<EntityRecord> {
        let row = sqlx::query_as::<_, EntityRecord>(
            r#"
            INSERT INTO entities
                (id_persistent, previous_version, display_txt, disabled, id_contribution)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING internal_id, id_persistent, previous_version, display_txt,
                      disabled, id_contribution, created_at
            "#,
        )
        .bind(id_persistent)
        .bind(previous_version)
        .bind(&draft.display_txt)
        .bind(draft.disabled)
        .bind(draft.id_contribution)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    fn unchanged(head: &EntityRecord, draft: &EntityDraft) -> bool {
        head.display_txt == draft.display_txt
            && head.disabled == draft.disabled
            && head.id_contribution == draft.id_contribution
    }
}

impl EntityStore {
    pub fn new(pool: PgPool, queue: Arc<dyn TaskQueue>, cache: Arc<dyn KeyValueCache>) -> Self {
        let tag_defs = TagDefStore::new(pool.clone(), queue.clone(), cache.clone());
        Self {
            pool,
            queue,
            cache,
            tag_defs,
        }
    }

    /// Append a new entity version (or create the chain) in its own
    /// transaction, then invalidate the display-text cache and enqueue a
    /// recompute.
    pub async fn change_or_create(
        &self,
        id_persistent: Uuid,
        expected_version: Option<i64>,
        draft: EntityDraft,
    ) -> Result<(EntityRecord, bool)> {
        let mut tx = self.pool.begin().await?;
        let (record, wrote) =
            <Self as VersionedStore>::change_or_create(self, tx.as_mut(), id_persistent, expected_version, &draft)
                .await?;
        tx.commit().await?;

        if wrote {
            debug!(entity = %id_persistent, version = record.internal_id, "entity version written");
            self.cache.delete(&display_txt_cache_key(id_persistent)).await;
            self.queue
                .enqueue(Task::RefreshDisplayTxt {
                    id_entity_persistent: id_persistent,
                })
                .await?;
        }
        Ok((record, wrote))
    }

    /// Same write primitive for callers that already hold a stage
    /// transaction. Follow-up tasks are the caller's responsibility, after
    /// its commit.
    pub(crate) async fn change_or_create_tx(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        expected_version: Option<i64>,
        draft: &EntityDraft,
    ) -> Result<(EntityRecord, bool)> {
        <Self as VersionedStore>::change_or_create(self, conn, id_persistent, expected_version, draft).await
    }

    /// Current head of a chain.
    pub async fn most_recent(&self, id_persistent: Uuid) -> Result<EntityRecord> {
        let row = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT internal_id, id_persistent, previous_version, display_txt,
                   disabled, id_contribution, created_at
            FROM entities
            WHERE id_persistent = $1
            ORDER BY internal_id DESC
            LIMIT 1
            "#,
        )
        .bind(id_persistent)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CurationError::NotFound(format!("entity {id_persistent}")))
    }

    /// Paginated head rows in creation order, optionally excluding disabled
    /// entities and entities still attached to an unmerged contribution.
    pub async fn most_recent_page(
        &self,
        offset: i64,
        limit: i64,
        include_disabled: bool,
        include_contributed: bool,
    ) -> Result<Vec<EntityRecord>> {
        let rows = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT e.internal_id, e.id_persistent, e.previous_version, e.display_txt,
                   e.disabled, e.id_contribution, e.created_at
            FROM entities e
            JOIN (
                SELECT MAX(internal_id) AS internal_id
                FROM entities
                GROUP BY id_persistent
            ) heads ON heads.internal_id = e.internal_id
            WHERE ($1 OR NOT e.disabled)
              AND ($2 OR e.id_contribution IS NULL)
            ORDER BY e.internal_id ASC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(include_disabled)
        .bind(include_contributed)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Head rows of the entities attached to a contribution.
    pub(crate) async fn heads_for_contribution(
        &self,
        conn: &mut PgConnection,
        id_contribution: Uuid,
    ) -> Result<Vec<EntityRecord>> {
        let rows = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT e.internal_id, e.id_persistent, e.previous_version, e.display_txt,
                   e.disabled, e.id_contribution, e.created_at
            FROM entities e
            JOIN (
                SELECT MAX(internal_id) AS internal_id
                FROM entities
                GROUP BY id_persistent
            ) heads ON heads.internal_id = e.internal_id
            WHERE e.id_contribution = $1
            ORDER BY e.internal_id ASC
            "#,
        )
        .bind(id_contribution)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    /// Delete every version row of a chain. Only used by duplicate
    /// elimination, where the contributed entity is replaced by an existing
    /// one and its history is worthless.
    pub(crate) async fn delete_chain(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
    ) -> Result<()> {
        sqlx::query("DELETE FROM entities WHERE id_persistent = $1")
            .bind(id_persistent)
            .execute(conn)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Display-text resolution
    // ------------------------------------------------------------------------

    /// Reader-side resolution: cheap, never recomputes. A cache miss means a
    /// refresh is pending and falls back to the persistent id.
    pub async fn display_txt_info(&self, entity: &EntityRecord) -> DisplayTxtInfo {
        if let Some(txt) = entity.display_txt.as_deref().filter(|t| !t.is_empty()) {
            return DisplayTxtInfo {
                display_txt: txt.to_string(),
                source: DisplayTxtSource::DisplayTxt,
            };
        }
        if let Some(cached) = self.cache.get(&display_txt_cache_key(entity.id_persistent)).await {
            if let Ok(info) = serde_json::from_value::<DisplayTxtInfo>(cached) {
                return info;
            }
        }
        DisplayTxtInfo {
            display_txt: entity.id_persistent.to_string(),
            source: DisplayTxtSource::IdPersistent,
        }
    }

    /// Background recompute: scan the configured display order for the first
    /// tag definition this entity carries a value for, and cache the result.
    pub async fn refresh_display_txt(&self, id_persistent: Uuid) -> Result<()> {
        let entity = self.most_recent(id_persistent).await?;
        let info = self.compute_display_txt(&entity).await?;
        self.cache
            .set(
                &display_txt_cache_key(id_persistent),
                serde_json::to_value(&info)?,
            )
            .await;
        debug!(entity = %id_persistent, "display text refreshed");
        Ok(())
    }

    async fn compute_display_txt(&self, entity: &EntityRecord) -> Result<DisplayTxtInfo> {
        if let Some(txt) = entity.display_txt.as_deref().filter(|t| !t.is_empty()) {
            return Ok(DisplayTxtInfo {
                display_txt: txt.to_string(),
                source: DisplayTxtSource::DisplayTxt,
            });
        }

        let order: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id_tag_definition_persistent FROM display_txt_order ORDER BY position ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        for (id_tag_definition,) in order {
            let value: Option<(Option<String>,)> = sqlx::query_as(
                r#"
                SELECT ti.value
                FROM tag_instances ti
                JOIN (
                    SELECT MAX(internal_id) AS internal_id
                    FROM tag_instances
                    GROUP BY id_persistent
                ) heads ON heads.internal_id = ti.internal_id
                WHERE ti.id_entity_persistent = $1
                  AND ti.id_tag_definition_persistent = $2
                ORDER BY ti.internal_id ASC
                LIMIT 1
                "#,
            )
            .bind(entity.id_persistent)
            .bind(id_tag_definition)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((Some(value),)) = value {
                let name_path = self.tag_defs.name_path(id_tag_definition).await?;
                return Ok(DisplayTxtInfo {
                    display_txt: value,
                    source: DisplayTxtSource::TagDefinition {
                        id_persistent: id_tag_definition,
                        name_path,
                    },
                });
            }
        }

        Ok(DisplayTxtInfo {
            display_txt: entity.id_persistent.to_string(),
            source: DisplayTxtSource::IdPersistent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchanged_ignores_version_linkage() {
        let record = EntityRecord {
            internal_id: 10,
            id_persistent: Uuid::new_v4(),
            previous_version: Some(4),
            display_txt: Some("test entity".into()),
            disabled: false,
            id_contribution: None,
            created_at: Utc::now(),
        };
        let same = EntityDraft::from_record(&record);
        assert!(EntityStore::unchanged(&record, &same));

        let changed = EntityDraft {
            disabled: true,
            ..same
        };
        assert!(!EntityStore::unchanged(&record, &changed));
    }

    #[test]
    fn test_display_txt_info_serializes_marker() {
        let info = DisplayTxtInfo {
            display_txt: "acme".into(),
            source: DisplayTxtSource::DisplayTxt,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["source"], "display_txt");

        let fallback = DisplayTxtInfo {
            display_txt: "0000".into(),
            source: DisplayTxtSource::IdPersistent,
        };
        let json = serde_json::to_value(&fallback).unwrap();
        assert_eq!(json["source"], "id_persistent");
    }
}
