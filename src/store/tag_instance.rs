//! Tag instance store.
//!
//! An instance binds an entity to a tag definition with a value typed by the
//! definition. Values are validated at write time; retrieval for an Inner
//! definition transparently includes the instances of all its descendants,
//! since Inner tags only group children and never carry values themselves.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::cache::KeyValueCache;
use crate::error::{CurationError, Result};
use crate::store::entity::display_txt_cache_key;
use crate::store::tag_def::{TagDefStore, TagType};
use crate::tasks::{Task, TaskQueue};
use crate::versioned::{VersionRow, VersionedStore};

/// One version row of a tag instance.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct TagInstanceRecord {
    pub internal_id: i64,
    pub id_persistent: Uuid,
    pub previous_version: Option<i64>,
    pub id_entity_persistent: Uuid,
    pub id_tag_definition_persistent: Uuid,
    pub value: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VersionRow for TagInstanceRecord {
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

/// Payload for a new tag instance version.
#[derive(Debug, Clone, PartialEq)]
pub struct TagInstanceDraft {
    pub id_entity_persistent: Uuid,
    pub id_tag_definition_persistent: Uuid,
    pub value: Option<String>,
}

impl TagInstanceDraft {
    pub fn from_record(record: &TagInstanceRecord) -> Self {
        Self {
            id_entity_persistent: record.id_entity_persistent,
            id_tag_definition_persistent: record.id_tag_definition_persistent,
            value: record.value.clone(),
        }
    }
}

/// Check a raw value against the owning definition's type.
pub fn validate_value(tag_type: TagType, value: Option<&str>) -> Result<()> {
    match (tag_type, value) {
        (TagType::Inner, None) => Ok(()),
        (TagType::Inner, Some(value)) => Err(CurationError::InvalidValue {
            value: value.to_string(),
            expected: "INNER".into(),
        }),
        (TagType::Float, Some(value)) => match value.trim().parse::<f64>() {
            Ok(parsed) if parsed.is_finite() => Ok(()),
            _ => Err(CurationError::InvalidValue {
                value: value.to_string(),
                expected: "FLOAT".into(),
            }),
        },
        (TagType::Float, None) => Err(CurationError::InvalidValue {
            value: String::new(),
            expected: "FLOAT".into(),
        }),
        (TagType::String, _) => Ok(()),
    }
}

const SELECT_INSTANCE: &str = r#"
    SELECT internal_id, id_persistent, previous_version, id_entity_persistent,
           id_tag_definition_persistent, value, created_at
    FROM tag_instances
"#;

/// Store for tag instance version chains.
#[derive(Clone)]
pub struct TagInstanceStore {
    pool: PgPool,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn KeyValueCache>,
    tag_defs: TagDefStore,
}

#[async_trait]
impl VersionedStore for TagInstanceStore {
    type Row = TagInstanceRecord;
    type Draft = TagInstanceDraft;

    async fn head_for_update(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
    ) -> Result<Option<TagInstanceRecord>> {
        let row = sqlx::query_as::<_, TagInstanceRecord>(&format!(
            "{SELECT_INSTANCE} WHERE id_persistent = $1 ORDER BY internal_id DESC LIMIT 1 FOR UPDATE"
        ))
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
        draft: &TagInstanceDraft,
    ) -> Result<TagInstanceRecord> {
        let row = sqlx::query_as::<_, TagInstanceRecord>(
            r#"
            INSERT INTO tag_instances
                (id_persistent, previous_version, id_entity_persistent,
                 id_tag_definition_persistent, value)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING internal_id, id_persistent, previous_version, id_entity_persistent,
                      id_tag_definition_persistent, value, created_at
            "#,
        )
        .bind(id_persistent)
        .bind(previous_version)
        .bind(draft.id_entity_persistent)
        .bind(draft.id_tag_definition_persistent)
        .bind(&draft.value)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    fn unchanged(head: &TagInstanceRecord, draft: &TagInstanceDraft) -> bool {
        head.id_entity_persistent == draft.id_entity_persistent
            && head.id_tag_definition_persistent == draft.id_tag_definition_persistent
            && head.value == draft.value
    }
}

impl TagInstanceStore {
    pub fn new(pool: PgPool, queue: Arc<dyn TaskQueue>, cache: Arc<dyn KeyValueCache>) -> Self {
        let tag_defs = TagDefStore::new(pool.clone(), queue.clone(), cache.clone());
        Self {
            pool,
            queue,
            cache,
            tag_defs,
        }
    }

    /// Validated write in its own transaction, with display-text cache
    /// invalidation for the touched entity.
    pub async fn change_or_create(
        &self,
        id_persistent: Uuid,
        expected_version: Option<i64>,
        draft: TagInstanceDraft,
    ) -> Result<(TagInstanceRecord, bool)> {
        let mut tx = self.pool.begin().await?;
        let (record, wrote) = self
            .change_or_create_tx(tx.as_mut(), id_persistent, expected_version, &draft)
            .await?;
        tx.commit().await?;

        if wrote {
            debug!(
                instance = %id_persistent,
                entity = %draft.id_entity_persistent,
                "tag instance version written"
            );
            self.cache
                .delete(&display_txt_cache_key(draft.id_entity_persistent))
                .await;
            self.queue
                .enqueue(Task::RefreshDisplayTxt {
                    id_entity_persistent: draft.id_entity_persistent,
                })
                .await?;
        }
        Ok((record, wrote))
    }

    /// Validated write inside a caller-held transaction; follow-up tasks are
    /// the caller's responsibility.
    pub(crate) async fn change_or_create_tx(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        expected_version: Option<i64>,
        draft: &TagInstanceDraft,
    ) -> Result<(TagInstanceRecord, bool)> {
        let def = self
            .tag_defs
            .most_recent_tx(conn, draft.id_tag_definition_persistent)
            .await?;
        validate_value(def.tag_type, draft.value.as_deref())?;
        <Self as VersionedStore>::change_or_create(self, conn, id_persistent, expected_version, draft).await
    }

    /// Current head of a chain.
    pub async fn most_recent(&self, id_persistent: Uuid) -> Result<TagInstanceRecord> {
        let row = sqlx::query_as::<_, TagInstanceRecord>(&format!(
            "{SELECT_INSTANCE} WHERE id_persistent = $1 ORDER BY internal_id DESC LIMIT 1"
        ))
        .bind(id_persistent)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CurationError::NotFound(format!("tag instance {id_persistent}")))
    }

    /// Head instances for a definition, expanded over its descendants.
    pub async fn for_definition(&self, id_tag_definition: Uuid) -> Result<Vec<TagInstanceRecord>> {
        let ids = self.tag_defs.self_and_descendant_ids(id_tag_definition).await?;
        let mut conn = self.pool.acquire().await?;
        self.heads_for_definition_set(&mut conn, &ids).await
    }

    pub(crate) async fn heads_for_definition_set(
        &self,
        conn: &mut PgConnection,
        definition_ids: &[Uuid],
    ) -> Result<Vec<TagInstanceRecord>> {
        let rows = sqlx::query_as::<_, TagInstanceRecord>(
            r#"
            SELECT ti.internal_id, ti.id_persistent, ti.previous_version,
                   ti.id_entity_persistent, ti.id_tag_definition_persistent,
                   ti.value, ti.created_at
            FROM tag_instances ti
            JOIN (
                SELECT MAX(internal_id) AS internal_id
                FROM tag_instances
                GROUP BY id_persistent
            ) heads ON heads.internal_id = ti.internal_id
            WHERE ti.id_tag_definition_persistent = ANY($1)
            ORDER BY ti.internal_id ASC
            "#,
        )
        .bind(definition_ids)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    /// Head instances carried by an entity.
    pub async fn for_entity(&self, id_entity: Uuid) -> Result<Vec<TagInstanceRecord>> {
        let mut conn = self.pool.acquire().await?;
        self.heads_for_entity(&mut conn, id_entity).await
    }

    pub(crate) async fn heads_for_entity(
        &self,
        conn: &mut PgConnection,
        id_entity: Uuid,
    ) -> Result<Vec<TagInstanceRecord>> {
        let rows = sqlx::query_as::<_, TagInstanceRecord>(
            r#"
            SELECT ti.internal_id, ti.id_persistent, ti.previous_version,
                   ti.id_entity_persistent, ti.id_tag_definition_persistent,
                   ti.value, ti.created_at
            FROM tag_instances ti
            JOIN (
                SELECT MAX(internal_id) AS internal_id
                FROM tag_instances
                GROUP BY id_persistent
            ) heads ON heads.internal_id = ti.internal_id
            WHERE ti.id_entity_persistent = $1
            ORDER BY ti.internal_id ASC
            "#,
        )
        .bind(id_entity)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    /// Head instance for a specific (entity, definition) pair, if any.
    pub(crate) async fn head_for_entity_and_definition(
        &self,
        conn: &mut PgConnection,
        id_entity: Uuid,
        id_tag_definition: Uuid,
    ) -> Result<Option<TagInstanceRecord>> {
        let row = sqlx::query_as::<_, TagInstanceRecord>(
            r#"
            SELECT ti.internal_id, ti.id_persistent, ti.previous_version,
                   ti.id_entity_persistent, ti.id_tag_definition_persistent,
                   ti.value, ti.created_at
            FROM tag_instances ti
            JOIN (
                SELECT MAX(internal_id) AS internal_id
                FROM tag_instances
                GROUP BY id_persistent
            ) heads ON heads.internal_id = ti.internal_id
            WHERE ti.id_entity_persistent = $1
              AND ti.id_tag_definition_persistent = $2
            LIMIT 1
            "#,
        )
        .bind(id_entity)
        .bind(id_tag_definition)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_values_must_parse() {
        assert!(validate_value(TagType::Float, Some("2.0")).is_ok());
        assert!(validate_value(TagType::Float, Some(" 17 ")).is_ok());
        assert!(validate_value(TagType::Float, Some("two")).is_err());
        assert!(validate_value(TagType::Float, Some("NaN")).is_err());
        assert!(validate_value(TagType::Float, None).is_err());
    }

    #[test]
    fn test_inner_tags_carry_no_values() {
        assert!(validate_value(TagType::Inner, None).is_ok());
        assert!(validate_value(TagType::Inner, Some("anything")).is_err());
    }

    #[test]
    fn test_string_accepts_free_text() {
        assert!(validate_value(TagType::String, Some("free text")).is_ok());
        assert!(validate_value(TagType::String, None).is_ok());
    }
}
