//! Merge engine shared machinery.
//!
//! Two request flavors (tag-level and entity-level) reconcile divergent
//! version chains. Both follow the same shape: automatic fast-forward when
//! the destination is empty, conflict detection otherwise, and explicit
//! human-recorded resolutions applied once none of them is stale.
//!
//! Resolutions reference the exact version rows (`internal_id`) they were
//! recorded against. Comparing those references with the current chain heads
//! is the staleness test: any later edit moves the head and excludes the
//! resolution until it is re-recorded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::tag_instance::TagInstanceRecord;

pub mod entity;
pub mod tag;

pub use entity::{EntityConflict, EntityMergeRequest, EntityMergeStore, ResolutionPartition};
pub use tag::{TagConflict, TagConflictResolution, TagMergeRequest, TagMergeStore};

/// Lifecycle of a merge request, either flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MergeRequestState {
    Open,
    Conflicts,
    Closed,
    Resolved,
    Merged,
    Error,
}

impl MergeRequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Conflicts => "CONFLICTS",
            Self::Closed => "CLOSED",
            Self::Resolved => "RESOLVED",
            Self::Merged => "MERGED",
            Self::Error => "ERROR",
        }
    }
}

/// A recorded resolution is current only while the rows it referenced are
/// still the chain heads.
pub fn reference_current(referenced: Option<i64>, head: Option<i64>) -> bool {
    referenced == head
}

/// Pair origin instances with the destination instance on the same entity.
///
/// Pairs whose values already agree need nothing. A missing destination
/// instance still needs a decision (copy or drop), so it counts as a
/// conflict here; the glossary-strict "both sides present and disagreeing"
/// cases are the subset with `destination: Some`.
pub(crate) fn pair_instances(
    origin: &[TagInstanceRecord],
    destination: &[TagInstanceRecord],
) -> Vec<(TagInstanceRecord, Option<TagInstanceRecord>)> {
    let by_entity: HashMap<Uuid, &TagInstanceRecord> = destination
        .iter()
        .map(|inst| (inst.id_entity_persistent, inst))
        .collect();

    origin
        .iter()
        .map(|inst| {
            let counterpart = by_entity.get(&inst.id_entity_persistent).copied().cloned();
            (inst.clone(), counterpart)
        })
        .collect()
}

/// Whether an origin/destination pair needs a human decision.
pub(crate) fn needs_resolution(
    origin: &TagInstanceRecord,
    destination: Option<&TagInstanceRecord>,
) -> bool {
    match destination {
        Some(dest) => dest.value != origin.value,
        None => true,
    }
}
