//! CSV contribution pipeline.
//!
//! A contribution walks a linear state machine from upload to merge:
//!
//! ```text
//! UPLOADED -> COLUMNS_EXTRACTED -> COLUMNS_ASSIGNED -> VALUES_EXTRACTED
//!          -> ENTITIES_MATCHED -> ENTITIES_ASSIGNED -> VALUES_ASSIGNED -> MERGED
//! ```
//!
//! Automatic stages (column extraction, value ingestion, duplicate
//! elimination) run in background tasks; the transitions in between are user
//! actions (column assignment, duplicate confirmation). Every automatic stage
//! claims the contribution row `FOR UPDATE SKIP LOCKED` in its expected
//! state and silently no-ops otherwise, so re-delivered tasks are harmless.
//! A stage failure records the error on the row and rolls the state back to
//! the stage's stable predecessor so the user can correct and retry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::UserRef;
use crate::error::{CurationError, Result};
use crate::store::tag_def::{TagDefRecord, TagDefStore};
use crate::tasks::{Task, TaskQueue};

pub mod dedup;
pub mod extract;
pub mod ingest;

pub use dedup::DuplicateStore;
pub use ingest::ContributionPipeline;

/// Pipeline position of a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionState {
    Uploaded,
    ColumnsExtracted,
    ColumnsAssigned,
    ValuesExtracted,
    EntitiesMatched,
    EntitiesAssigned,
    ValuesAssigned,
    Merged,
}

impl ContributionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "UPLOADED",
            Self::ColumnsExtracted => "COLUMNS_EXTRACTED",
            Self::ColumnsAssigned => "COLUMNS_ASSIGNED",
            Self::ValuesExtracted => "VALUES_EXTRACTED",
            Self::EntitiesMatched => "ENTITIES_MATCHED",
            Self::EntitiesAssigned => "ENTITIES_ASSIGNED",
            Self::ValuesAssigned => "VALUES_ASSIGNED",
            Self::Merged => "MERGED",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Contribution {
    pub id_persistent: Uuid,
    pub name: String,
    pub description: String,
    pub file_name: String,
    pub has_header: bool,
    pub created_by: String,
    pub state: ContributionState,
    pub error_msg: Option<String>,
    pub error_trace: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Assignment target of a CSV column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ColumnTarget {
    /// The column feeds the entity's display text.
    DisplayTxt,
    /// The column feeds values of an existing tag definition.
    Existing { id_persistent: Uuid },
}

/// Sentinel stored in `contribution_columns.id_existing_persistent` for the
/// display-text column. Every other value is a tag definition uuid.
const DISPLAY_TXT_SENTINEL: &str = "display_txt";

impl ColumnTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == DISPLAY_TXT_SENTINEL {
            return Ok(Self::DisplayTxt);
        }
        let id = Uuid::parse_str(raw).map_err(|_| CurationError::InvalidValue {
            value: raw.to_string(),
            expected: "'display_txt' or a tag definition id".into(),
        })?;
        Ok(Self::Existing { id_persistent: id })
    }

    pub fn as_db_str(&self) -> String {
        match self {
            Self::DisplayTxt => DISPLAY_TXT_SENTINEL.to_string(),
            Self::Existing { id_persistent } => id_persistent.to_string(),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ContributionColumn {
    pub id: i64,
    pub id_contribution: Uuid,
    pub name: String,
    pub index_in_file: i32,
    pub id_existing_persistent: Option<String>,
    pub discard: bool,
}

impl ContributionColumn {
    pub fn target(&self) -> Result<Option<ColumnTarget>> {
        self.id_existing_persistent
            .as_deref()
            .map(ColumnTarget::parse)
            .transpose()
    }
}

/// Fields a user may change before ingestion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContributionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub has_header: Option<bool>,
}

/// Check a complete column assignment before handing the contribution to
/// ingestion. Exactly one display-text column; every kept column mapped to a
/// distinct, visible, existing tag definition.
pub(crate) fn check_column_assignments(
    columns: &[ContributionColumn],
    definitions: &HashMap<Uuid, TagDefRecord>,
) -> Result<()> {
    let mut display_txt_columns = 0usize;
    let mut seen_targets: HashSet<Uuid> = HashSet::new();
    let mut unassigned = Vec::new();
    let mut invalid = Vec::new();
    let mut duplicated = Vec::new();

    for column in columns {
        if column.discard {
            continue;
        }
        match column.target()? {
            None => unassigned.push(column.name.clone()),
            Some(ColumnTarget::DisplayTxt) => {
                display_txt_columns += 1;
                if display_txt_columns > 1 {
                    duplicated.push(column.name.clone());
                }
            }
            Some(ColumnTarget::Existing { id_persistent }) => {
                match definitions.get(&id_persistent) {
                    Some(def) if !def.hidden && !def.disabled => {
                        if !seen_targets.insert(id_persistent) {
                            duplicated.push(column.name.clone());
                        }
                    }
                    _ => invalid.push(column.name.clone()),
                }
            }
        }
    }

    if !unassigned.is_empty() {
        return Err(CurationError::InvalidTagAssignment { columns: unassigned });
    }
    if !invalid.is_empty() {
        return Err(CurationError::InvalidTagAssignment { columns: invalid });
    }
    if !duplicated.is_empty() {
        return Err(CurationError::DuplicateAssignment {
            columns: duplicated,
        });
    }
    if display_txt_columns == 0 {
        return Err(CurationError::InvalidTagAssignment {
            columns: vec![DISPLAY_TXT_SENTINEL.to_string()],
        });
    }
    Ok(())
}

const SELECT_CONTRIBUTION: &str = r#"
    SELECT id_persistent, name, description, file_name, has_header, created_by,
           state, error_msg, error_trace, created_at
    FROM contributions
"#;

const SELECT_COLUMN: &str = r#"
    SELECT id, id_contribution, name, index_in_file, id_existing_persistent, discard
    FROM contribution_columns
"#;

#[derive(Clone)]
pub struct ContributionStore {
    pool: PgPool,
    queue: Arc<dyn TaskQueue>,
    tag_defs: TagDefStore,
}

impl ContributionStore {
    pub fn new(pool: PgPool, queue: Arc<dyn TaskQueue>, tag_defs: TagDefStore) -> Self {
        Self {
            pool,
            queue,
            tag_defs,
        }
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    /// Register an uploaded file and schedule column extraction.
    pub async fn create(
        &self,
        user: &UserRef,
        name: &str,
        description: &str,
        file_name: &str,
        has_header: bool,
    ) -> Result<Contribution> {
        if !user.permission_group.may_contribute() {
            return Err(CurationError::Forbidden(format!(
                "{} may not upload contributions",
                user.name
            )));
        }

        let contribution = sqlx::query_as::<_, Contribution>(
            r#"
            INSERT INTO contributions
                (id_persistent, name, description, file_name, has_header, created_by, state)
            VALUES ($1, $2, $3, $4, $5, $6, 'UPLOADED')
            RETURNING id_persistent, name, description, file_name, has_header, created_by,
                      state, error_msg, error_trace, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .bind(file_name)
        .bind(has_header)
        .bind(&user.name)
        .fetch_one(&self.pool)
        .await?;

        info!(contribution = %contribution.id_persistent, user = %user.name, "contribution uploaded");
        self.queue
            .enqueue(Task::ExtractColumns {
                id_contribution: contribution.id_persistent,
            })
            .await?;
        Ok(contribution)
    }

    pub(crate) async fn get(&self, id_persistent: Uuid) -> Result<Contribution> {
        let row = sqlx::query_as::<_, Contribution>(&format!(
            "{SELECT_CONTRIBUTION} WHERE id_persistent = $1"
        ))
        .bind(id_persistent)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CurationError::NotFound(format!("contribution {id_persistent}")))
    }

    /// A contribution is visible to its uploader and to elevated users.
    pub async fn get_for_user(&self, user: &UserRef, id_persistent: Uuid) -> Result<Contribution> {
        let contribution = self.get(id_persistent).await?;
        if contribution.created_by != user.name && !user.permission_group.is_elevated() {
            return Err(CurationError::Forbidden(format!(
                "{} may not access contribution {id_persistent}",
                user.name
            )));
        }
        Ok(contribution)
    }

    pub async fn list_by_owner(&self, user: &UserRef) -> Result<Vec<Contribution>> {
        let rows = sqlx::query_as::<_, Contribution>(&format!(
            "{SELECT_CONTRIBUTION} WHERE created_by = $1 ORDER BY created_at ASC"
        ))
        .bind(&user.name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Update metadata before ingestion. Toggling the header flag invalidates
    /// the extracted columns: they are dropped and extraction is re-run.
    pub async fn patch(
        &self,
        user: &UserRef,
        id_persistent: Uuid,
        patch: ContributionPatch,
    ) -> Result<Contribution> {
        let contribution = self.get_for_user(user, id_persistent).await?;
        if !matches!(
            contribution.state,
            ContributionState::Uploaded
                | ContributionState::ColumnsExtracted
                | ContributionState::ColumnsAssigned
        ) {
            return Err(CurationError::InvalidState {
                state: contribution.state.as_str().to_string(),
                operation: "patch contribution",
            });
        }

        let header_changed = patch
            .has_header
            .map(|flag| flag != contribution.has_header)
            .unwrap_or(false);

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query_as::<_, Contribution>(
            r#"
            UPDATE contributions
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                has_header = COALESCE($4, has_header)
            WHERE id_persistent = $1
            RETURNING id_persistent, name, description, file_name, has_header, created_by,
                      state, error_msg, error_trace, created_at
            "#,
        )
        .bind(id_persistent)
        .bind(&patch.name)
        .bind(&patch.description)
        .bind(patch.has_header)
        .fetch_one(tx.as_mut())
        .await?;

        if header_changed {
            sqlx::query("DELETE FROM contribution_columns WHERE id_contribution = $1")
                .bind(id_persistent)
                .execute(tx.as_mut())
                .await?;
            sqlx::query(
                "UPDATE contributions SET state = 'UPLOADED' WHERE id_persistent = $1",
            )
            .bind(id_persistent)
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;

        if header_changed {
            self.queue
                .enqueue(Task::ExtractColumns {
                    id_contribution: id_persistent,
                })
                .await?;
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------------
    // Column assignment
    // ------------------------------------------------------------------------

    pub async fn columns(&self, id_contribution: Uuid) -> Result<Vec<ContributionColumn>> {
        let rows = sqlx::query_as::<_, ContributionColumn>(&format!(
            "{SELECT_COLUMN} WHERE id_contribution = $1 ORDER BY index_in_file ASC"
        ))
        .bind(id_contribution)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Point one column at a target (or discard it). Only possible while the
    /// extracted columns are on display, before the user completes the
    /// assignment.
    pub async fn patch_column(
        &self,
        user: &UserRef,
        id_contribution: Uuid,
        index_in_file: i32,
        target: Option<ColumnTarget>,
        discard: bool,
    ) -> Result<ContributionColumn> {
        let contribution = self.get_for_user(user, id_contribution).await?;
        if contribution.state != ContributionState::ColumnsExtracted {
            return Err(CurationError::InvalidState {
                state: contribution.state.as_str().to_string(),
                operation: "assign column",
            });
        }

        let row = sqlx::query_as::<_, ContributionColumn>(
            r#"
            UPDATE contribution_columns
            SET id_existing_persistent = $3, discard = $4
            WHERE id_contribution = $1 AND index_in_file = $2
            RETURNING id, id_contribution, name, index_in_file, id_existing_persistent, discard
            "#,
        )
        .bind(id_contribution)
        .bind(index_in_file)
        .bind(target.as_ref().map(ColumnTarget::as_db_str))
        .bind(discard)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| {
            CurationError::NotFound(format!(
                "column {index_in_file} of contribution {id_contribution}"
            ))
        })
    }

    /// Validate the full assignment and hand the contribution to ingestion.
    pub async fn complete_assignment(&self, user: &UserRef, id_contribution: Uuid) -> Result<()> {
        let contribution = self.get_for_user(user, id_contribution).await?;
        if contribution.state != ContributionState::ColumnsExtracted {
            return Err(CurationError::InvalidState {
                state: contribution.state.as_str().to_string(),
                operation: "complete column assignment",
            });
        }

        let columns = self.columns(id_contribution).await?;
        let mut definitions = HashMap::new();
        for column in &columns {
            if let Some(ColumnTarget::Existing { id_persistent }) = column.target()? {
                if let Ok(def) = self.tag_defs.most_recent(id_persistent).await {
                    definitions.insert(id_persistent, def);
                }
            }
        }
        check_column_assignments(&columns, &definitions)?;

        let updated = sqlx::query(
            "UPDATE contributions SET state = 'COLUMNS_ASSIGNED' WHERE id_persistent = $1 AND state = 'COLUMNS_EXTRACTED'",
        )
        .bind(id_contribution)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(CurationError::InvalidState {
                state: contribution.state.as_str().to_string(),
                operation: "complete column assignment",
            });
        }

        info!(contribution = %id_contribution, "column assignment completed");
        self.queue
            .enqueue(Task::IngestValues { id_contribution })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stage plumbing (used by the extraction/ingestion/dedup stages)
    // ------------------------------------------------------------------------

    /// Claim the contribution if it sits in the expected state; `None` when
    /// the state moved on or another worker holds the row.
    pub(crate) async fn claim(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        expected_state: ContributionState,
    ) -> Result<Option<Contribution>> {
        let row = sqlx::query_as::<_, Contribution>(&format!(
            "{SELECT_CONTRIBUTION} WHERE id_persistent = $1 AND state = $2 FOR UPDATE SKIP LOCKED"
        ))
        .bind(id_persistent)
        .bind(expected_state)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    pub(crate) async fn set_state(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        state: ContributionState,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE contributions SET state = $2, error_msg = NULL, error_trace = NULL WHERE id_persistent = $1",
        )
        .bind(id_persistent)
        .bind(state)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Record a stage failure and roll back to the stage's stable
    /// predecessor so the user can correct the input and retry.
    pub(crate) async fn fail_stage(
        &self,
        id_persistent: Uuid,
        rollback_state: ContributionState,
        err: &CurationError,
    ) {
        let result = sqlx::query(
            "UPDATE contributions SET state = $2, error_msg = $3, error_trace = $4 WHERE id_persistent = $1",
        )
        .bind(id_persistent)
        .bind(rollback_state)
        .bind(err.pipeline_msg())
        .bind(err.pipeline_trace())
        .execute(&self.pool)
        .await;
        if let Err(db_err) = result {
            warn!(contribution = %id_persistent, error = %db_err, "failed to record stage error");
        }
    }

    pub(crate) async fn replace_columns(
        &self,
        conn: &mut PgConnection,
        id_contribution: Uuid,
        names: &[String],
    ) -> Result<()> {
        sqlx::query("DELETE FROM contribution_columns WHERE id_contribution = $1")
            .bind(id_contribution)
            .execute(&mut *conn)
            .await?;
        for (index, name) in names.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO contribution_columns (id_contribution, name, index_in_file)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(id_contribution)
            .bind(name)
            .bind(index as i32)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tag_def::TagType;
    use chrono::Utc;

    fn column(index: i32, name: &str, target: Option<&str>, discard: bool) -> ContributionColumn {
        ContributionColumn {
            id: index as i64,
            id_contribution: Uuid::nil(),
            name: name.to_string(),
            index_in_file: index,
            id_existing_persistent: target.map(String::from),
            discard,
        }
    }

    fn definition(id: Uuid, hidden: bool) -> TagDefRecord {
        TagDefRecord {
            internal_id: 1,
            id_persistent: id,
            previous_version: None,
            name: "height".into(),
            id_parent_persistent: None,
            tag_type: TagType::Float,
            owner: Some("alice".into()),
            curated: false,
            hidden,
            disabled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(
            ColumnTarget::parse("display_txt").unwrap(),
            ColumnTarget::DisplayTxt
        );
        let id = Uuid::new_v4();
        assert_eq!(
            ColumnTarget::parse(&id.to_string()).unwrap(),
            ColumnTarget::Existing { id_persistent: id }
        );
        assert!(ColumnTarget::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_assignment_requires_all_kept_columns_mapped() {
        let id = Uuid::new_v4();
        let defs = HashMap::from([(id, definition(id, false))]);
        let columns = vec![
            column(0, "0", Some("display_txt"), false),
            column(1, "1", None, false),
        ];
        let err = check_column_assignments(&columns, &defs).unwrap_err();
        assert!(matches!(err, CurationError::InvalidTagAssignment { columns } if columns == vec!["1"]));
    }

    #[test]
    fn test_assignment_rejects_hidden_targets() {
        let id = Uuid::new_v4();
        let defs = HashMap::from([(id, definition(id, true))]);
        let columns = vec![
            column(0, "0", Some("display_txt"), false),
            column(1, "1", Some(&id.to_string()), false),
        ];
        assert!(matches!(
            check_column_assignments(&columns, &defs),
            Err(CurationError::InvalidTagAssignment { .. })
        ));
    }

    #[test]
    fn test_assignment_rejects_duplicate_targets_by_column_name() {
        let id = Uuid::new_v4();
        let defs = HashMap::from([(id, definition(id, false))]);
        let columns = vec![
            column(0, "label", Some("display_txt"), false),
            column(1, "first", Some(&id.to_string()), false),
            column(2, "second", Some(&id.to_string()), false),
        ];
        let err = check_column_assignments(&columns, &defs).unwrap_err();
        assert!(matches!(err, CurationError::DuplicateAssignment { columns } if columns == vec!["second"]));
    }

    #[test]
    fn test_assignment_requires_display_txt_column() {
        let id = Uuid::new_v4();
        let defs = HashMap::from([(id, definition(id, false))]);
        let columns = vec![column(0, "0", Some(&id.to_string()), false)];
        assert!(matches!(
            check_column_assignments(&columns, &defs),
            Err(CurationError::InvalidTagAssignment { .. })
        ));
    }

    #[test]
    fn test_assignment_accepts_discarded_unmapped_columns() {
        let id = Uuid::new_v4();
        let defs = HashMap::from([(id, definition(id, false))]);
        let columns = vec![
            column(0, "0", Some("display_txt"), false),
            column(1, "1", Some(&id.to_string()), false),
            column(2, "2", None, true),
        ];
        assert!(check_column_assignments(&columns, &defs).is_ok());
    }
}
