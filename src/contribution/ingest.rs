//! Automatic pipeline stages: column extraction and value ingestion.
//!
//! Ingestion never writes into existing tag definitions directly. Each mapped
//! column gets a hidden child definition under its target; the contributed
//! values land there, and a tag merge request per column carries them toward
//! the target under the owner's control. Until the contribution is merged its
//! entities stay attached to it (and hidden from regular listings).

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::KeyValueCache;
use crate::config::StorageConfig;
use crate::contribution::extract::{parse_column_names, parse_rows, read_contribution_file};
use crate::contribution::{ColumnTarget, ContributionState, ContributionStore};
use crate::error::{CurationError, Result};
use crate::merge::tag::TagMergeStore;
use crate::store::entity::{EntityDraft, EntityStore};
use crate::store::tag_def::{TagDefDraft, TagDefRecord, TagDefStore};
use crate::store::tag_instance::{validate_value, TagInstanceDraft, TagInstanceStore};
use crate::tasks::TaskQueue;

/// Stage runner for the automatic parts of the contribution pipeline.
#[derive(Clone)]
pub struct ContributionPipeline {
    pool: PgPool,
    storage: StorageConfig,
    contributions: ContributionStore,
    entities: EntityStore,
    tag_defs: TagDefStore,
    instances: TagInstanceStore,
    tag_merges: TagMergeStore,
}

impl ContributionPipeline {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<dyn KeyValueCache>,
        storage: StorageConfig,
    ) -> Self {
        let tag_defs = TagDefStore::new(pool.clone(), queue.clone(), cache.clone());
        let contributions = ContributionStore::new(pool.clone(), queue.clone(), tag_defs.clone());
        let entities = EntityStore::new(pool.clone(), queue.clone(), cache.clone());
        let instances = TagInstanceStore::new(pool.clone(), queue.clone(), cache.clone());
        let tag_merges = TagMergeStore::new(pool.clone(), queue, cache);
        Self {
            pool,
            storage,
            contributions,
            entities,
            tag_defs,
            instances,
            tag_merges,
        }
    }

    pub fn contributions(&self) -> &ContributionStore {
        &self.contributions
    }

    // ------------------------------------------------------------------------
    // Stage: column extraction (UPLOADED -> COLUMNS_EXTRACTED)
    // ------------------------------------------------------------------------

    pub async fn extract_columns(&self, id_contribution: Uuid) -> Result<()> {
        match self.extract_columns_inner(id_contribution).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.contributions
                    .fail_stage(id_contribution, ContributionState::Uploaded, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn extract_columns_inner(&self, id_contribution: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(contribution) = self
            .contributions
            .claim(tx.as_mut(), id_contribution, ContributionState::Uploaded)
            .await?
        else {
            return Ok(());
        };

        let text = read_contribution_file(&self.storage, &contribution.file_name).await?;
        let names = parse_column_names(&text, contribution.has_header)?;

        self.contributions
            .replace_columns(tx.as_mut(), id_contribution, &names)
            .await?;
        self.contributions
            .set_state(tx.as_mut(), id_contribution, ContributionState::ColumnsExtracted)
            .await?;
        tx.commit().await?;

        info!(
            contribution = %id_contribution,
            columns = names.len(),
            "columns extracted"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stage: value ingestion (COLUMNS_ASSIGNED -> VALUES_EXTRACTED)
    // ------------------------------------------------------------------------

    pub async fn ingest_values(&self, id_contribution: Uuid) -> Result<()> {
        match self.ingest_values_inner(id_contribution).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Back to the assignment screen so the user can remap and retry.
                self.contributions
                    .fail_stage(id_contribution, ContributionState::ColumnsExtracted, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn ingest_values_inner(&self, id_contribution: Uuid) -> Result<()> {
        let columns = self.contributions.columns(id_contribution).await?;

        let mut tx = self.pool.begin().await?;
        let Some(contribution) = self
            .contributions
            .claim(tx.as_mut(), id_contribution, ContributionState::ColumnsAssigned)
            .await?
        else {
            return Ok(());
        };

        let text = read_contribution_file(&self.storage, &contribution.file_name).await?;
        let rows = parse_rows(&text, contribution.has_header)?;

        let mut display_index: Option<usize> = None;
        // (column index, target definition head, hidden child id)
        let mut mapped: Vec<(usize, TagDefRecord, Uuid)> = Vec::new();

        for column in &columns {
            if column.discard {
                continue;
            }
            match column.target()? {
                Some(ColumnTarget::DisplayTxt) => display_index = Some(column.index_in_file as usize),
                Some(ColumnTarget::Existing { id_persistent }) => {
                    let existing = self.tag_defs.most_recent_tx(tx.as_mut(), id_persistent).await?;
                    let id_child = Uuid::new_v4();
                    let draft = TagDefDraft {
                        name: format!("{} Merge Request {}", existing.name, contribution.name),
                        id_parent_persistent: Some(existing.id_persistent),
                        tag_type: existing.tag_type,
                        owner: Some(contribution.created_by.clone()),
                        curated: false,
                        hidden: true,
                        disabled: false,
                    };
                    self.tag_defs.create_child_tx(tx.as_mut(), id_child, &draft).await?;
                    mapped.push((column.index_in_file as usize, existing, id_child));
                }
                None => {}
            }
        }

        let display_index = display_index.ok_or_else(|| CurationError::InvalidTagAssignment {
            columns: vec!["display_txt".to_string()],
        })?;

        let mut entity_count = 0usize;
        let mut value_count = 0usize;
        let mut skipped = 0usize;

        for row in &rows {
            let display_txt = row
                .get(display_index)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(String::from);

            let entity_draft = EntityDraft {
                display_txt,
                disabled: false,
                id_contribution: Some(id_contribution),
            };
            let (entity, _) = self
                .entities
                .change_or_create_tx(tx.as_mut(), Uuid::new_v4(), None, &entity_draft)
                .await?;
            entity_count += 1;

            for (index, existing, id_child) in &mapped {
                let Some(cell) = row.get(*index).map(|v| v.trim()).filter(|v| !v.is_empty())
                else {
                    continue;
                };
                // Cells the target type rejects are dropped, not fatal: a
                // single bad row must not sink the whole file.
                if validate_value(existing.tag_type, Some(cell)).is_err() {
                    skipped += 1;
                    continue;
                }
                let draft = TagInstanceDraft {
                    id_entity_persistent: entity.id_persistent,
                    id_tag_definition_persistent: *id_child,
                    value: Some(cell.to_string()),
                };
                self.instances
                    .change_or_create_tx(tx.as_mut(), Uuid::new_v4(), None, &draft)
                    .await?;
                value_count += 1;
            }
        }

        // One merge request per mapped column. Fast-forward waits until
        // duplicate elimination has rewritten instances onto the surviving
        // entities.
        for (_, existing, id_child) in &mapped {
            self.tag_merges
                .create_tx(
                    tx.as_mut(),
                    &contribution.created_by,
                    existing.owner.as_deref(),
                    *id_child,
                    existing.id_persistent,
                    Some(id_contribution),
                    true,
                )
                .await?;
        }

        self.contributions
            .set_state(tx.as_mut(), id_contribution, ContributionState::ValuesExtracted)
            .await?;
        tx.commit().await?;

        if skipped > 0 {
            warn!(contribution = %id_contribution, skipped, "cells rejected by target type");
        }
        info!(
            contribution = %id_contribution,
            entities = entity_count,
            values = value_count,
            requests = mapped.len(),
            "values ingested"
        );
        Ok(())
    }
}
