//! Append-only version-chain mechanics shared by entities, tag definitions
//! and tag instances.
//!
//! A logical record is identified by `id_persistent`; every write appends a
//! new row whose `previous_version` points at the prior head. The most recent
//! version is the row with the highest `internal_id` for a persistent id.
//! Chains never fork: the schema enforces UNIQUE(previous_version).
//!
//! Writes go through [`VersionedStore::change_or_create`], the optimistic
//! concurrency primitive: callers pass the head `internal_id` they based
//! their edit on, and the write fails with [`CurationError::StaleVersion`]
//! if someone got there first.

use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{CurationError, Result};

/// Version-linkage fields present on every chained record kind.
pub trait VersionRow {
    fn internal_id(&self) -> i64;
    fn id_persistent(&self) -> Uuid;
    fn previous_version(&self) -> Option<i64>;
}

/// What a change-or-create call decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePlan {
    /// The draft is field-for-field identical to the head; nothing to write.
    NoWrite,
    /// Append a new row linked to the given prior head.
    Append { previous_version: Option<i64> },
}

/// Pure decision kernel for change-or-create.
///
/// `current` is the head's internal id (None when the persistent id is
/// unknown), `expected_version` the version the caller based its edit on,
/// and `unchanged` whether the draft payload equals the head payload.
pub fn plan_change(
    current: Option<i64>,
    expected_version: Option<i64>,
    unchanged: bool,
) -> Result<ChangePlan> {
    match (current, expected_version) {
        (None, None) => Ok(ChangePlan::Append {
            previous_version: None,
        }),
        (None, Some(expected)) => Err(CurationError::NotFound(format!(
            "no record exists for expected version {expected}"
        ))),
        (Some(_), None) => Err(CurationError::AlreadyExists),
        (Some(current), Some(expected)) if expected != current => {
            Err(CurationError::StaleVersion { current })
        }
        (Some(_), Some(_)) if unchanged => Ok(ChangePlan::NoWrite),
        (Some(current), Some(_)) => Ok(ChangePlan::Append {
            previous_version: Some(current),
        }),
    }
}

/// Store for one version-chained record kind.
///
/// Implementors supply the SQL for fetching the locked head row and appending
/// a version; the shared `change_or_create` default drives the optimistic
/// concurrency protocol on top of them.
#[async_trait]
pub trait VersionedStore {
    type Row: VersionRow + Send + Sync;
    type Draft: Send + Sync;

    /// Fetch the current head for a persistent id, locking it
    /// (`FOR UPDATE`) so concurrent appends serialize.
    async fn head_for_update(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
    ) -> Result<Option<Self::Row>>;

    /// Append a new version row.
    async fn append(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        previous_version: Option<i64>,
        draft: &Self::Draft,
    ) -> Result<Self::Row>;

    /// Whether the draft payload equals the head payload, ignoring timestamps
    /// and version-linkage fields.
    fn unchanged(head: &Self::Row, draft: &Self::Draft) -> bool;

    /// Append a new version if the draft differs from the head and the
    /// caller's expected version is current. Returns the resulting head and
    /// whether a row was written.
    async fn change_or_create(
        &self,
        conn: &mut PgConnection,
        id_persistent: Uuid,
        expected_version: Option<i64>,
        draft: &Self::Draft,
    ) -> Result<(Self::Row, bool)> {
        let head = self.head_for_update(conn, id_persistent).await?;
        let unchanged = head
            .as_ref()
            .map(|h| Self::unchanged(h, draft))
            .unwrap_or(false);
        let current = head.as_ref().map(VersionRow::internal_id);

        match plan_change(current, expected_version, unchanged)? {
            ChangePlan::NoWrite => match head {
                Some(row) => Ok((row, false)),
                None => Err(CurationError::NotFound(id_persistent.to_string())),
            },
            ChangePlan::Append { previous_version } => {
                let row = self
                    .append(conn, id_persistent, previous_version, draft)
                    .await?;
                Ok((row, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_without_version() {
        assert_eq!(
            plan_change(None, None, false).unwrap(),
            ChangePlan::Append {
                previous_version: None
            }
        );
    }

    #[test]
    fn test_create_over_existing_fails() {
        assert!(matches!(
            plan_change(Some(3), None, false),
            Err(CurationError::AlreadyExists)
        ));
    }

    #[test]
    fn test_stale_version_reports_current_head() {
        match plan_change(Some(7), Some(3), false) {
            Err(CurationError::StaleVersion { current }) => assert_eq!(current, 7),
            other => panic!("expected StaleVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_payload_is_a_no_write() {
        assert_eq!(
            plan_change(Some(7), Some(7), true).unwrap(),
            ChangePlan::NoWrite
        );
    }

    #[test]
    fn test_changed_payload_appends_to_head() {
        assert_eq!(
            plan_change(Some(7), Some(7), false).unwrap(),
            ChangePlan::Append {
                previous_version: Some(7)
            }
        );
    }

    #[test]
    fn test_update_of_unknown_record_is_not_found() {
        assert!(matches!(
            plan_change(None, Some(1), false),
            Err(CurationError::NotFound(_))
        ));
    }
}
