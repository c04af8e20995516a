//! Tag definition store.
//!
//! Tag definitions form a forest: `Inner` definitions group children and
//! never carry values themselves; `Float` and `String` definitions type the
//! values of their instances. Definitions are owned by a user or curated
//! (ownerless, governed by elevated roles). The full breadcrumb of a
//! definition (root…self) is cached and refreshed by a background task that
//! propagates to descendants.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::access::UserRef;
use crate::cache::KeyValueCache;
use crate::error::{CurationError, Result};
use crate::tasks::{Task, TaskQueue};
use crate::versioned::{VersionRow, VersionedStore};

/// Value type of a tag definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TagType {
    /// Groups children; instances of an Inner tag never carry values.
    Inner,
    Float,
    String,
}

impl TagType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inner => "INNER",
            Self::Float => "FLOAT",
            Self::String => "STRING",
        }
    }
}

impl std::fmt::Display for TagType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One version row of a tag definition.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct TagDefRecord {
    pub internal_id: i64,
    pub id_persistent: Uuid,
    pub previous_version: Option<i64>,
    pub name: String,
    pub id_parent_persistent: Option<Uuid>,
    pub tag_type: TagType,
    pub owner: Option<String>,
    pub curated: bool,
    pub hidden: bool,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl TagDefRecord {
    /// Whether a user may write instances against this definition or change
    /// it: its owner, or any elevated user when the tag is curated.
    pub fn has_write_access(&self, user: &UserRef) -> bool {
        if self.owner.as_deref() == Some(user.name.as_str()) {
            return true;
        }
        self.curated && user.permission_group.is_elevated()
    }
}

impl VersionRow for TagDefRecord {
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

/// Payload for a new tag definition version.
#[derive(Debug, Clone, PartialEq)]
pub struct TagDefDraft {
    pub name: String,
    pub id_parent_persistent: Option<Uuid>,
    pub tag_type: TagType,
    pub owner: Option<String>,
    pub curated: bool,
    pub hidden: bool,
    pub disabled: bool,
}

impl TagDefDraft {
    pub fn new(name: impl Into<String>, tag_type: TagType, owner: Option<String>) -> Self {
        Self {
            name: name.into(),
            id_parent_persistent: None,
            tag_type,
            owner,
            curated: false,
            hidden: false,
            disabled: false,
        }
    }

    pub fn from_record(record: &TagDefRecord) -> Self {
        Self {
            name: record.name.clone(),
            id_parent_persistent: record.id_parent_persistent,
            tag_type: record.tag_type,
            owner: record.owner.clone(),
            curated: record.curated,
            hidden: record.hidden,
            disabled: record.disabled,
        }
    }
}

pub(crate) fn name_path_cache_key(id_persistent: Uuid) -> String {
    format!("name_path:{id_persistent}")
}

/// Store for tag definition version chains.
#[derive(Clone)]
pub struct TagDefStore {
    pool: PgPool,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn KeyValueCache>,
}

const SELECT_TAG_DEF: &str = r#"
    SELECT internal_id, id_persistent, previous_version, name, id_parent_persistent,
           tag_type, owner, curated, hidden, disabled, created_at
    FROM tag_definitions
"#;

#[async_trait]
impl VersionedStore for TagDefStore {
    type Row = TagDefRecord;
    type Draft = TagDefDraft;

    async fn head_for_update(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
    ) -> Result<Option<TagDefRecord>> {
        let row = sqlx::query_as::<_, TagDefRecord>(&format!(
            "{SELECT_TAG_DEF} WHERE id_persistent = $1 ORDER BY internal_id DESC LIMIT 1 FOR UPDATE"
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
        draft: &TagDefDraft,
    ) -> Result<TagDefRecord> {
        let row = sqlx::query_as::<_, TagDefRecord>(
            r#"
            INSERT INTO tag_definitions
                (id_persistent, previous_version, name, id_parent_persistent,
                 tag_type, owner, curated, hidden, disabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING internal_id, id_persistent, previous_version, name, id_parent_persistent,
                      tag_type, owner, curated, hidden, disabled, created_at
            "#,
        )
        .bind(id_persistent)
        .bind(previous_version)
        .bind(&draft.name)
        .bind(draft.id_parent_persistent)
        .bind(draft.tag_type)
        .bind(&draft.owner)
        .bind(draft.curated)
        .bind(draft.hidden)
        .bind(draft.disabled)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    fn unchanged(head: &TagDefRecord, draft: &TagDefDraft) -> bool {
        head.name == draft.name
            && head.id_parent_persistent == draft.id_parent_persistent
            && head.tag_type == draft.tag_type
            && head.owner == draft.owner
            && head.curated == draft.curated
            && head.hidden == draft.hidden
            && head.disabled == draft.disabled
    }
}

impl TagDefStore {
    pub fn new(pool: PgPool, queue: Arc<dyn TaskQueue>, cache: Arc<dyn KeyValueCache>) -> Self {
        Self { pool, queue, cache }
    }

    /// Validated write: the parent (when given) must exist and be
    /// Inner-typed, and the name must be unique among active siblings.
    pub async fn change_or_create(
        &self,
        id_persistent: Uuid,
        expected_version: Option<i64>,
        draft: TagDefDraft,
    ) -> Result<(TagDefRecord, bool)> {
        let mut tx = self.pool.begin().await?;
        self.check_parent(tx.as_mut(), &draft).await?;
        self.check_sibling_name(tx.as_mut(), id_persistent, &draft)
            .await?;
        let (record, wrote) =
            <Self as VersionedStore>::change_or_create(self, tx.as_mut(), id_persistent, expected_version, &draft)
                .await?;
        tx.commit().await?;

        if wrote {
            debug!(tag = %id_persistent, version = record.internal_id, "tag definition version written");
            self.cache.delete(&name_path_cache_key(id_persistent)).await;
            self.queue
                .enqueue(Task::RefreshNamePath {
                    id_tag_definition_persistent: id_persistent,
                })
                .await?;
        }
        Ok((record, wrote))
    }

    /// Write path for pipeline- and merge-synthesized children. These hang
    /// under the mapped existing tag whatever its type, so the
    /// parent-must-be-Inner check is skipped; sibling-name uniqueness still
    /// holds. Follow-up tasks are the caller's responsibility.
    pub(crate) async fn create_child_tx(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        draft: &TagDefDraft,
    ) -> Result<TagDefRecord> {
        self.check_sibling_name(conn, id_persistent, draft).await?;
        let (record, _) =
            <Self as VersionedStore>::change_or_create(self, conn, id_persistent, None, draft).await?;
        Ok(record)
    }

    /// Unvalidated optimistic write inside a caller-held transaction, for
    /// flag flips (disable, owner transfer) where the payload is derived from
    /// the head itself.
    pub(crate) async fn change_or_create_tx(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        expected_version: Option<i64>,
        draft: &TagDefDraft,
    ) -> Result<(TagDefRecord, bool)> {
        <Self as VersionedStore>::change_or_create(self, conn, id_persistent, expected_version, draft).await
    }

    async fn check_parent(&self, conn: &mut PgConnection, draft: &TagDefDraft) -> Result<()> {
        let Some(parent_id) = draft.id_parent_persistent else {
            return Ok(());
        };
        let parent = self
            .head(conn, parent_id)
            .await?
            .ok_or_else(|| CurationError::NotFound(format!("tag definition {parent_id}")))?;
        if parent.tag_type != TagType::Inner {
            return Err(CurationError::InvalidParent(parent_id.to_string()));
        }
        Ok(())
    }

    async fn check_sibling_name(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        draft: &TagDefDraft,
    ) -> Result<()> {
        let clash: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT td.id_persistent
            FROM tag_definitions td
            JOIN (
                SELECT MAX(internal_id) AS internal_id
                FROM tag_definitions
                GROUP BY id_persistent
            ) heads ON heads.internal_id = td.internal_id
            WHERE td.id_parent_persistent IS NOT DISTINCT FROM $1
              AND td.name = $2
              AND td.id_persistent <> $3
              AND NOT td.disabled
            LIMIT 1
            "#,
        )
        .bind(draft.id_parent_persistent)
        .bind(&draft.name)
        .bind(id_persistent)
        .fetch_optional(conn)
        .await?;

        if clash.is_some() {
            return Err(CurationError::DuplicateName(draft.name.clone()));
        }
        Ok(())
    }

    async fn head(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
    ) -> Result<Option<TagDefRecord>> {
        let row = sqlx::query_as::<_, TagDefRecord>(&format!(
            "{SELECT_TAG_DEF} WHERE id_persistent = $1 ORDER BY internal_id DESC LIMIT 1"
        ))
        .bind(id_persistent)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Current head of a chain.
    pub async fn most_recent(&self, id_persistent: Uuid) -> Result<TagDefRecord> {
        let mut conn = self.pool.acquire().await?;
        self.head(&mut conn, id_persistent)
            .await?
            .ok_or_else(|| CurationError::NotFound(format!("tag definition {id_persistent}")))
    }

    pub(crate) async fn most_recent_tx(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
    ) -> Result<TagDefRecord> {
        self.head(conn, id_persistent)
            .await?
            .ok_or_else(|| CurationError::NotFound(format!("tag definition {id_persistent}")))
    }

    /// Active head rows whose parent is the given id (None for roots).
    pub async fn children(&self, id_parent_persistent: Option<Uuid>) -> Result<Vec<TagDefRecord>> {
        let rows = sqlx::query_as::<_, TagDefRecord>(
            r#"
            SELECT td.internal_id, td.id_persistent, td.previous_version, td.name,
                   td.id_parent_persistent, td.tag_type, td.owner, td.curated,
                   td.hidden, td.disabled, td.created_at
            FROM tag_definitions td
            JOIN (
                SELECT MAX(internal_id) AS internal_id
                FROM tag_definitions
                GROUP BY id_persistent
            ) heads ON heads.internal_id = td.internal_id
            WHERE td.id_parent_persistent IS NOT DISTINCT FROM $1
              AND NOT td.disabled
            ORDER BY td.internal_id ASC
            "#,
        )
        .bind(id_parent_persistent)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// The definition plus all its descendants, breadth first. Instance
    /// retrieval for an Inner tag expands over this set.
    pub async fn self_and_descendant_ids(&self, id_persistent: Uuid) -> Result<Vec<Uuid>> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut frontier = vec![id_persistent];
        let mut out = Vec::new();

        while let Some(id) = frontier.pop() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            for child in self.children(Some(id)).await? {
                frontier.push(child.id_persistent);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Name-path resolution
    // ------------------------------------------------------------------------

    /// Breadcrumb root…self. Cached; a miss walks the parent links and fills
    /// the cache.
    pub async fn name_path(&self, id_persistent: Uuid) -> Result<Vec<String>> {
        if let Some(cached) = self.cache.get(&name_path_cache_key(id_persistent)).await {
            if let Ok(path) = serde_json::from_value::<Vec<String>>(cached) {
                return Ok(path);
            }
        }
        let path = self.compute_name_path(id_persistent).await?;
        self.cache
            .set(&name_path_cache_key(id_persistent), serde_json::to_value(&path)?)
            .await;
        Ok(path)
    }

    async fn compute_name_path(&self, id_persistent: Uuid) -> Result<Vec<String>> {
        let mut path = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut cursor = Some(id_persistent);

        while let Some(id) = cursor {
            if !seen.insert(id) {
                // Defensive stop on a cyclic parent link left by bad data.
                break;
            }
            let def = self.most_recent(id).await?;
            path.push(def.name);
            cursor = def.id_parent_persistent;
        }
        path.reverse();
        Ok(path)
    }

    /// Background recompute: refresh this definition's cached path and
    /// propagate to every cached descendant, since their breadcrumbs embed
    /// this definition's name.
    pub async fn refresh_name_path(&self, id_persistent: Uuid) -> Result<()> {
        let path = self.compute_name_path(id_persistent).await?;
        self.cache
            .set(&name_path_cache_key(id_persistent), serde_json::to_value(&path)?)
            .await;

        for id in self.self_and_descendant_ids(id_persistent).await? {
            if id == id_persistent {
                continue;
            }
            let path = self.compute_name_path(id).await?;
            self.cache
                .set(&name_path_cache_key(id), serde_json::to_value(&path)?)
                .await;
        }
        debug!(tag = %id_persistent, "name paths refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PermissionGroup;

    fn record(owner: Option<&str>, curated: bool) -> TagDefRecord {
        TagDefRecord {
            internal_id: 1,
            id_persistent: Uuid::new_v4(),
            previous_version: None,
            name: "height".into(),
            id_parent_persistent: None,
            tag_type: TagType::Float,
            owner: owner.map(String::from),
            curated,
            hidden: false,
            disabled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_owner_has_write_access() {
        let def = record(Some("alice"), false);
        assert!(def.has_write_access(&UserRef::new("alice", PermissionGroup::Contributor)));
        assert!(!def.has_write_access(&UserRef::new("bob", PermissionGroup::Contributor)));
    }

    #[test]
    fn test_curated_tags_are_writable_by_elevated_users_only() {
        let def = record(None, true);
        assert!(def.has_write_access(&UserRef::new("carol", PermissionGroup::Editor)));
        assert!(def.has_write_access(&UserRef::new("dan", PermissionGroup::Commissioner)));
        assert!(!def.has_write_access(&UserRef::new("eve", PermissionGroup::Contributor)));
    }

    #[test]
    fn test_unowned_uncurated_tag_rejects_everyone() {
        let def = record(None, false);
        assert!(!def.has_write_access(&UserRef::new("root", PermissionGroup::Commissioner)));
    }

    #[test]
    fn test_unchanged_compares_payload_fields() {
        let rec = record(Some("alice"), false);
        let same = TagDefDraft::from_record(&rec);
        assert!(TagDefStore::unchanged(&rec, &same));

        let renamed = TagDefDraft {
            name: "width".into(),
            ..same
        };
        assert!(!TagDefStore::unchanged(&rec, &renamed));
    }
}
