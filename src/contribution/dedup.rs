//! Duplicate matching and elimination.
//!
//! Matching is two-stage: a pg_trgm `similarity()` filter prunes the
//! candidate set inside Postgres, then the survivors are re-ranked in process
//! with normalized Levenshtein similarity. The SQL stage is cheap and recalls
//! broadly; the re-rank is the precision filter.
//!
//! Elimination consumes the user-confirmed assignments: instances of a
//! duplicated entity are rewritten onto the surviving entity and the
//! duplicate's chain is deleted, while unmatched entities are detached from
//! the contribution and become regular entities.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{PermissionGroup, UserRef};
use crate::cache::KeyValueCache;
use crate::contribution::{ContributionState, ContributionStore};
use crate::error::{CurationError, Result};
use crate::merge::tag::TagMergeStore;
use crate::store::entity::{EntityDraft, EntityRecord, EntityStore};
use crate::store::tag_def::TagDefStore;
use crate::store::tag_instance::{TagInstanceDraft, TagInstanceStore};
use crate::tasks::{Task, TaskQueue};

/// Trigram filter threshold for the SQL candidate stage.
const SIMILARITY_THRESHOLD: f32 = 0.3;
/// Candidates surviving the SQL stage, per query.
const CANDIDATE_LIMIT: i64 = 10;
/// Normalized Levenshtein cutoff for the re-rank stage.
const LEVENSHTEIN_THRESHOLD: f64 = 0.75;

/// A user-confirmed duplicate: the contributed origin entity is to be
/// replaced by an existing destination entity.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EntityDuplicate {
    pub id: i64,
    pub id_contribution: Uuid,
    pub id_origin_persistent: Uuid,
    pub id_destination_persistent: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A match candidate with its re-ranked similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct EntityMatch {
    pub entity: EntityRecord,
    pub similarity: f64,
}

/// Re-rank trigram candidates by normalized Levenshtein similarity,
/// descending, dropping everything below the cutoff.
pub(crate) fn rank_by_levenshtein(query: &str, candidates: Vec<EntityRecord>) -> Vec<EntityMatch> {
    let query = query.to_lowercase();
    let mut matches: Vec<EntityMatch> = candidates
        .into_iter()
        .filter_map(|entity| {
            let display_txt = entity.display_txt.as_deref()?.to_lowercase();
            let similarity = strsim::normalized_levenshtein(&query, &display_txt);
            (similarity >= LEVENSHTEIN_THRESHOLD).then_some(EntityMatch { entity, similarity })
        })
        .collect();
    matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    matches
}

#[derive(Clone)]
pub struct DuplicateStore {
    pool: PgPool,
    queue: Arc<dyn TaskQueue>,
    contributions: ContributionStore,
    entities: EntityStore,
    instances: TagInstanceStore,
    tag_merges: TagMergeStore,
}

impl DuplicateStore {
    pub fn new(pool: PgPool, queue: Arc<dyn TaskQueue>, cache: Arc<dyn KeyValueCache>) -> Self {
        let tag_defs = TagDefStore::new(pool.clone(), queue.clone(), cache.clone());
        let contributions = ContributionStore::new(pool.clone(), queue.clone(), tag_defs);
        let entities = EntityStore::new(pool.clone(), queue.clone(), cache.clone());
        let instances = TagInstanceStore::new(pool.clone(), queue.clone(), cache.clone());
        let tag_merges = TagMergeStore::new(pool.clone(), queue.clone(), cache);
        Self {
            pool,
            queue,
            contributions,
            entities,
            instances,
            tag_merges,
        }
    }

    // ------------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------------

    /// Existing entities whose display text resembles the query. Contributed
    /// and disabled entities never appear as destinations.
    pub async fn match_candidates(&self, display_txt: &str) -> Result<Vec<EntityMatch>> {
        let candidates = sqlx::query_as::<_, EntityRecord>(
            r#"
            SELECT e.internal_id, e.id_persistent, e.previous_version, e.display_txt,
                   e.disabled, e.id_contribution, e.created_at
            FROM entities e
            JOIN (
                SELECT MAX(internal_id) AS internal_id
                FROM entities
                GROUP BY id_persistent
            ) heads ON heads.internal_id = e.internal_id
            WHERE e.id_contribution IS NULL
              AND NOT e.disabled
              AND e.display_txt IS NOT NULL
              AND similarity(e.display_txt, $1) > $2
            ORDER BY similarity(e.display_txt, $1) DESC
            LIMIT $3
            "#,
        )
        .bind(display_txt)
        .bind(SIMILARITY_THRESHOLD)
        .bind(CANDIDATE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        Ok(rank_by_levenshtein(display_txt, candidates))
    }

    /// Candidates for every entity of a contribution. The first call moves
    /// the contribution into the matching stage.
    pub async fn candidates_for_contribution(
        &self,
        user: &UserRef,
        id_contribution: Uuid,
    ) -> Result<Vec<(EntityRecord, Vec<EntityMatch>)>> {
        let contribution = self.contributions.get_for_user(user, id_contribution).await?;
        match contribution.state {
            ContributionState::ValuesExtracted => {
                sqlx::query(
                    "UPDATE contributions SET state = 'ENTITIES_MATCHED' WHERE id_persistent = $1 AND state = 'VALUES_EXTRACTED'",
                )
                .bind(id_contribution)
                .execute(&self.pool)
                .await?;
            }
            ContributionState::EntitiesMatched => {}
            other => {
                return Err(CurationError::InvalidState {
                    state: other.as_str().to_string(),
                    operation: "match duplicates",
                })
            }
        }

        let mut conn = self.pool.acquire().await?;
        let contributed = self
            .entities
            .heads_for_contribution(&mut conn, id_contribution)
            .await?;
        drop(conn);

        let mut out = Vec::with_capacity(contributed.len());
        for entity in contributed {
            let matches = match entity.display_txt.as_deref() {
                Some(txt) if !txt.is_empty() => self.match_candidates(txt).await?,
                _ => Vec::new(),
            };
            out.push((entity, matches));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------------

    /// Confirm (or clear, with `None`) the duplicate destination for one
    /// contributed entity.
    pub async fn assign_duplicate(
        &self,
        user: &UserRef,
        id_contribution: Uuid,
        id_origin: Uuid,
        id_destination: Option<Uuid>,
    ) -> Result<()> {
        let contribution = self.contributions.get_for_user(user, id_contribution).await?;
        if contribution.state != ContributionState::EntitiesMatched {
            return Err(CurationError::InvalidState {
                state: contribution.state.as_str().to_string(),
                operation: "assign duplicate",
            });
        }

        let origin = self.entities.most_recent(id_origin).await?;
        if origin.id_contribution != Some(id_contribution) {
            return Err(CurationError::NotFound(format!(
                "entity {id_origin} in contribution {id_contribution}"
            )));
        }

        match id_destination {
            Some(id_destination) => {
                let destination = self.entities.most_recent(id_destination).await?;
                if destination.id_contribution.is_some() || destination.disabled {
                    return Err(CurationError::InvalidValue {
                        value: id_destination.to_string(),
                        expected: "an active, non-contributed entity".into(),
                    });
                }
                sqlx::query(
                    r#"
                    INSERT INTO entity_duplicates
                        (id_contribution, id_origin_persistent, id_destination_persistent)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (id_origin_persistent)
                    DO UPDATE SET id_destination_persistent = $3, created_at = now()
                    "#,
                )
                .bind(id_contribution)
                .bind(id_origin)
                .bind(id_destination)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM entity_duplicates WHERE id_origin_persistent = $1")
                    .bind(id_origin)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn duplicates(&self, id_contribution: Uuid) -> Result<Vec<EntityDuplicate>> {
        let mut conn = self.pool.acquire().await?;
        self.duplicates_tx(&mut conn, id_contribution).await
    }

    async fn duplicates_tx(
        &self,
        conn: &mut PgConnection,
        id_contribution: Uuid,
    ) -> Result<Vec<EntityDuplicate>> {
        let rows = sqlx::query_as::<_, EntityDuplicate>(
            r#"
            SELECT id, id_contribution, id_origin_persistent, id_destination_persistent, created_at
            FROM entity_duplicates
            WHERE id_contribution = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id_contribution)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    /// Close the matching stage and schedule elimination.
    pub async fn complete_entity_assignment(
        &self,
        user: &UserRef,
        id_contribution: Uuid,
    ) -> Result<()> {
        let contribution = self.contributions.get_for_user(user, id_contribution).await?;
        let updated = sqlx::query(
            "UPDATE contributions SET state = 'ENTITIES_ASSIGNED' WHERE id_persistent = $1 AND state = 'ENTITIES_MATCHED'",
        )
        .bind(id_contribution)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(CurationError::InvalidState {
                state: contribution.state.as_str().to_string(),
                operation: "complete duplicate assignment",
            });
        }

        self.queue
            .enqueue(Task::EliminateDuplicates { id_contribution })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stage: elimination (ENTITIES_ASSIGNED -> VALUES_ASSIGNED [-> MERGED])
    // ------------------------------------------------------------------------

    pub async fn eliminate_duplicates(&self, id_contribution: Uuid) -> Result<()> {
        match self.eliminate_duplicates_inner(id_contribution).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Back to matching so the user can revisit assignments.
                self.contributions
                    .fail_stage(id_contribution, ContributionState::ValuesExtracted, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn eliminate_duplicates_inner(&self, id_contribution: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(contribution) = self
            .contributions
            .claim(tx.as_mut(), id_contribution, ContributionState::EntitiesAssigned)
            .await?
        else {
            return Ok(());
        };

        let assignments: HashMap<Uuid, Uuid> = self
            .duplicates_tx(tx.as_mut(), id_contribution)
            .await?
            .into_iter()
            .map(|d| (d.id_origin_persistent, d.id_destination_persistent))
            .collect();
        let contributed = self
            .entities
            .heads_for_contribution(tx.as_mut(), id_contribution)
            .await?;

        let mut touched = Vec::new();
        for entity in contributed {
            match assignments.get(&entity.id_persistent) {
                Some(id_destination) => {
                    // Rewrite every instance onto the surviving entity, then
                    // drop the duplicate's chain outright: it never left the
                    // contribution, so its history carries nothing.
                    let instances = self
                        .instances
                        .heads_for_entity(tx.as_mut(), entity.id_persistent)
                        .await?;
                    for instance in instances {
                        let draft = TagInstanceDraft {
                            id_entity_persistent: *id_destination,
                            ..TagInstanceDraft::from_record(&instance)
                        };
                        self.instances
                            .change_or_create_tx(
                                tx.as_mut(),
                                instance.id_persistent,
                                Some(instance.internal_id),
                                &draft,
                            )
                            .await?;
                    }
                    self.entities
                        .delete_chain(tx.as_mut(), entity.id_persistent)
                        .await?;
                    touched.push(*id_destination);
                }
                None => {
                    // Genuinely new: detach from the contribution and let it
                    // surface in regular listings.
                    let draft = EntityDraft {
                        id_contribution: None,
                        ..EntityDraft::from_record(&entity)
                    };
                    self.entities
                        .change_or_create_tx(
                            tx.as_mut(),
                            entity.id_persistent,
                            Some(entity.internal_id),
                            &draft,
                        )
                        .await?;
                    touched.push(entity.id_persistent);
                }
            }
        }

        sqlx::query("DELETE FROM entity_duplicates WHERE id_contribution = $1")
            .bind(id_contribution)
            .execute(tx.as_mut())
            .await?;

        let request_ids = self
            .tag_merges
            .ids_for_contribution(tx.as_mut(), id_contribution)
            .await?;
        self.contributions
            .set_state(tx.as_mut(), id_contribution, ContributionState::ValuesAssigned)
            .await?;
        tx.commit().await?;

        info!(
            contribution = %id_contribution,
            entities = touched.len(),
            requests = request_ids.len(),
            "duplicates eliminated"
        );
        for id_entity in touched {
            self.queue
                .enqueue(Task::RefreshDisplayTxt {
                    id_entity_persistent: id_entity,
                })
                .await?;
        }

        // Fast-forward the contribution's merge requests as its uploader.
        // Requests the uploader may not write stay open for their owners.
        let requester = UserRef::new(&contribution.created_by, PermissionGroup::Contributor);
        for id_request in request_ids {
            // A failing fast-forward is recorded on the request; it must not
            // unwind the already-committed elimination.
            if let Err(err) = self.tag_merges.fast_forward(id_request, &requester).await {
                warn!(request = %id_request, error = %err, "contribution fast-forward failed");
            }
        }
        // Covers the no-request case; requests that park in conflicts flip
        // the contribution later, when they finally merge or close.
        self.tag_merges.refresh_contribution_state(id_contribution).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(display_txt: &str) -> EntityRecord {
        EntityRecord {
            internal_id: 1,
            id_persistent: Uuid::new_v4(),
            previous_version: None,
            display_txt: Some(display_txt.to_string()),
            disabled: false,
            id_contribution: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_near_identical_names_survive_the_rerank() {
        // One substitution in thirteen characters: 1 - 1/13 ~ 0.923.
        let matches = rank_by_levenshtein("test entity 0", vec![entity("test entity d")]);
        assert_eq!(matches.len(), 1);
        assert!((matches[0].similarity - (1.0 - 1.0 / 13.0)).abs() < 1e-9);
    }

    #[test]
    fn test_distant_names_are_dropped() {
        let matches = rank_by_levenshtein(
            "test entity 0",
            vec![entity("completely different label")],
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn test_matches_sorted_by_similarity_descending() {
        let matches = rank_by_levenshtein(
            "test entity 0",
            vec![entity("test entity dd"), entity("test entity 0")],
        );
        assert_eq!(matches.len(), 2);
        assert!(matches[0].similarity >= matches[1].similarity);
        assert_eq!(matches[0].entity.display_txt.as_deref(), Some("test entity 0"));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let matches = rank_by_levenshtein("Test Entity 0", vec![entity("test entity 0")]);
        assert_eq!(matches.len(), 1);
        assert!((matches[0].similarity - 1.0).abs() < 1e-9);
    }
}
