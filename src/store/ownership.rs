//! Ownership transfer, curation, and display-text ordering policy.
//!
//! A tag definition is either owned by a single user or curated (ownerless,
//! governed by elevated roles). Ownership moves through explicit request
//! objects: the current owner petitions, the receiver accepts. Curating a tag
//! cancels pending petitions and unassigns in-flight merge requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::access::UserRef;
use crate::error::{CurationError, Result};
use crate::store::tag_def::{TagDefDraft, TagDefStore};

/// A pending ownership transfer for one tag definition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OwnershipRequest {
    pub id_persistent: Uuid,
    pub petitioner: String,
    pub receiver: String,
    pub id_tag_definition_persistent: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OwnershipStore {
    pool: PgPool,
    tag_defs: TagDefStore,
}

impl OwnershipStore {
    pub fn new(pool: PgPool, tag_defs: TagDefStore) -> Self {
        Self { pool, tag_defs }
    }

    // ------------------------------------------------------------------------
    // Owner / curation flags
    // ------------------------------------------------------------------------

    /// Transfer ownership. No write when the user already owns the tag.
    pub async fn set_owner(&self, id_tag_definition: Uuid, new_owner: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let wrote = self.set_owner_tx(tx.as_mut(), id_tag_definition, new_owner).await?;
        tx.commit().await?;
        Ok(wrote)
    }

    async fn set_owner_tx(
        &self,
        conn: &mut PgConnection,
        id_tag_definition: Uuid,
        new_owner: &str,
    ) -> Result<bool> {
        let head = self.tag_defs.most_recent_tx(conn, id_tag_definition).await?;
        if head.owner.as_deref() == Some(new_owner) {
            return Ok(false);
        }
        let draft = TagDefDraft {
            owner: Some(new_owner.to_string()),
            curated: false,
            ..TagDefDraft::from_record(&head)
        };
        let (_, wrote) = self
            .tag_defs
            .change_or_create_tx(conn, id_tag_definition, Some(head.internal_id), &draft)
            .await?;
        Ok(wrote)
    }

    /// Hand the tag over to commissioner governance. Cascades: pending
    /// ownership petitions are deleted and in-flight tag merge requests lose
    /// their assignee.
    pub async fn set_curated(&self, id_tag_definition: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let head = self.tag_defs.most_recent_tx(tx.as_mut(), id_tag_definition).await?;
        let draft = TagDefDraft {
            owner: None,
            curated: true,
            ..TagDefDraft::from_record(&head)
        };
        self.tag_defs
            .change_or_create_tx(tx.as_mut(), id_tag_definition, Some(head.internal_id), &draft)
            .await?;

        sqlx::query("DELETE FROM ownership_requests WHERE id_tag_definition_persistent = $1")
            .bind(id_tag_definition)
            .execute(tx.as_mut())
            .await?;

        sqlx::query(
            r#"
            UPDATE tag_merge_requests
            SET assigned_to = NULL
            WHERE id_destination_persistent = $1
              AND state IN ('OPEN', 'CONFLICTS')
            "#,
        )
        .bind(id_tag_definition)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;
        info!(tag = %id_tag_definition, "tag definition curated");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Ownership requests
    // ------------------------------------------------------------------------

    /// Petition to hand the tag to `receiver`. Replaces any existing request
    /// for the same tag.
    pub async fn create_request(
        &self,
        petitioner: &UserRef,
        receiver: &str,
        id_tag_definition: Uuid,
    ) -> Result<OwnershipRequest> {
        let def = self.tag_defs.most_recent(id_tag_definition).await?;
        if !def.has_write_access(petitioner) {
            return Err(CurationError::Forbidden(format!(
                "{} may not transfer tag {id_tag_definition}",
                petitioner.name
            )));
        }

        let request = sqlx::query_as::<_, OwnershipRequest>(
            r#"
            INSERT INTO ownership_requests
                (id_persistent, petitioner, receiver, id_tag_definition_persistent)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id_tag_definition_persistent)
            DO UPDATE SET id_persistent = $1, petitioner = $2, receiver = $3, created_at = now()
            RETURNING id_persistent, petitioner, receiver, id_tag_definition_persistent, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&petitioner.name)
        .bind(receiver)
        .bind(id_tag_definition)
        .fetch_one(&self.pool)
        .await?;
        Ok(request)
    }

    pub async fn get_request(&self, id_persistent: Uuid) -> Result<OwnershipRequest> {
        let row = sqlx::query_as::<_, OwnershipRequest>(
            r#"
            SELECT id_persistent, petitioner, receiver, id_tag_definition_persistent, created_at
            FROM ownership_requests
            WHERE id_persistent = $1
            "#,
        )
        .bind(id_persistent)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CurationError::NotFound(format!("ownership request {id_persistent}")))
    }

    /// Accept a petition: transfers ownership, deletes the request, and
    /// reassigns in-flight merge requests for the tag to the new owner.
    pub async fn accept_request(&self, user: &UserRef, id_request: Uuid) -> Result<()> {
        let request = self.get_request(id_request).await?;
        if request.receiver != user.name {
            return Err(CurationError::Forbidden(format!(
                "{} is not the receiver of this ownership request",
                user.name
            )));
        }

        let mut tx = self.pool.begin().await?;
        self.set_owner_tx(
            tx.as_mut(),
            request.id_tag_definition_persistent,
            &request.receiver,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE tag_merge_requests
            SET assigned_to = $2
            WHERE id_destination_persistent = $1
              AND state IN ('OPEN', 'CONFLICTS')
            "#,
        )
        .bind(request.id_tag_definition_persistent)
        .bind(&request.receiver)
        .execute(tx.as_mut())
        .await?;

        sqlx::query("DELETE FROM ownership_requests WHERE id_persistent = $1")
            .bind(id_request)
            .execute(tx.as_mut())
            .await?;

        tx.commit().await?;
        info!(
            tag = %request.id_tag_definition_persistent,
            owner = %request.receiver,
            "ownership transferred"
        );
        Ok(())
    }

    /// Withdraw a petition: by its petitioner, or by an elevated user when
    /// the tag is curated.
    pub async fn delete_request(&self, user: &UserRef, id_request: Uuid) -> Result<()> {
        let request = self.get_request(id_request).await?;
        let def = self
            .tag_defs
            .most_recent(request.id_tag_definition_persistent)
            .await?;

        let permitted = request.petitioner == user.name
            || (def.curated && user.permission_group.is_elevated());
        if !permitted {
            return Err(CurationError::Forbidden(format!(
                "{} may not delete this ownership request",
                user.name
            )));
        }

        sqlx::query("DELETE FROM ownership_requests WHERE id_persistent = $1")
            .bind(id_request)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Display-text ordering
    // ------------------------------------------------------------------------

    /// Append a tag definition to the display order; no-op when present.
    pub async fn display_order_append(&self, id_tag_definition: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO display_txt_order (id_tag_definition_persistent)
            VALUES ($1)
            ON CONFLICT (id_tag_definition_persistent) DO NOTHING
            "#,
        )
        .bind(id_tag_definition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn display_order_remove(&self, id_tag_definition: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM display_txt_order WHERE id_tag_definition_persistent = $1")
            .bind(id_tag_definition)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn display_order(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id_tag_definition_persistent FROM display_txt_order ORDER BY position ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
