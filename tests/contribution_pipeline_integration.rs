//! End-to-end contribution pipeline test: upload a headerless CSV, assign
//! columns, ingest, confirm a duplicate, eliminate, and verify the values
//! arrive at the target tag definition through the fast-forwarded merge.
//!
//! Run with a test database:
//!   DATABASE_URL=postgresql://localhost/tagmere_test \
//!     cargo test --test contribution_pipeline_integration -- --ignored

mod common;

use uuid::Uuid;

use common::{get_shared_pool, memory_cache, null_queue, unique};
use tagmere::access::{PermissionGroup, UserRef};
use tagmere::config::StorageConfig;
use tagmere::contribution::{ColumnTarget, ContributionPipeline, ContributionState, DuplicateStore};
use tagmere::error::CurationError;
use tagmere::merge::{MergeRequestState, TagMergeStore};
use tagmere::store::entity::{EntityDraft, EntityStore};
use tagmere::store::tag_def::{TagDefDraft, TagDefStore, TagType};
use tagmere::store::tag_instance::{TagInstanceDraft, TagInstanceStore};

#[tokio::test]
#[ignore]
async fn test_headerless_csv_end_to_end() {
    let pool = get_shared_pool().await;
    let queue = null_queue();
    let cache = memory_cache();

    let entities = EntityStore::new(pool.clone(), queue.clone(), cache.clone());
    let tag_defs = TagDefStore::new(pool.clone(), queue.clone(), cache.clone());
    let instances = TagInstanceStore::new(pool.clone(), queue.clone(), cache.clone());

    // The uploader owns the target tag, so the contribution's merge request
    // can fast-forward on its behalf.
    let alice = UserRef::new(unique("alice"), PermissionGroup::Contributor);

    let existing_label = unique("test entity");
    let (existing_entity, _) = entities
        .change_or_create(
            Uuid::new_v4(),
            None,
            EntityDraft {
                display_txt: Some(format!("{existing_label} 0")),
                ..EntityDraft::default()
            },
        )
        .await
        .unwrap();
    let (height, _) = tag_defs
        .change_or_create(
            Uuid::new_v4(),
            None,
            TagDefDraft::new(unique("height"), TagType::Float, Some(alice.name.clone())),
        )
        .await
        .unwrap();

    // Headerless file: one near-duplicate of the existing entity, one new.
    let upload_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        upload_dir.path().join("upload.csv"),
        format!("{existing_label} d,2.0\n{},3.5\n", unique("brand new")),
    )
    .unwrap();
    let storage = StorageConfig {
        upload_dir: upload_dir.path().to_path_buf(),
    };

    let pipeline = ContributionPipeline::new(pool.clone(), queue.clone(), cache.clone(), storage);
    let duplicates = DuplicateStore::new(pool.clone(), queue.clone(), cache.clone());
    let contributions = pipeline.contributions();

    let contribution = contributions
        .create(&alice, &unique("survey"), "", "upload.csv", false)
        .await
        .unwrap();
    let id = contribution.id_persistent;

    // Stage: column extraction. Headerless columns are named positionally.
    pipeline.extract_columns(id).await.unwrap();
    let columns = contributions.columns(id).await.unwrap();
    assert_eq!(
        columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["0", "1"]
    );

    // Completing with an unmapped column is rejected.
    contributions
        .patch_column(&alice, id, 0, Some(ColumnTarget::DisplayTxt), false)
        .await
        .unwrap();
    let err = contributions.complete_assignment(&alice, id).await.unwrap_err();
    assert!(matches!(err, CurationError::InvalidTagAssignment { .. }));

    contributions
        .patch_column(
            &alice,
            id,
            1,
            Some(ColumnTarget::Existing {
                id_persistent: height.id_persistent,
            }),
            false,
        )
        .await
        .unwrap();
    contributions.complete_assignment(&alice, id).await.unwrap();

    // Stage: ingestion.
    pipeline.ingest_values(id).await.unwrap();
    assert_eq!(
        contributions.get_for_user(&alice, id).await.unwrap().state,
        ContributionState::ValuesExtracted
    );

    // Matching: the near-duplicate resolves to the existing entity.
    let candidates = duplicates.candidates_for_contribution(&alice, id).await.unwrap();
    assert_eq!(candidates.len(), 2);
    let near_duplicate_label = format!("{existing_label} d");
    let (near_duplicate, matches) = candidates
        .iter()
        .find(|(entity, _)| entity.display_txt.as_deref() == Some(near_duplicate_label.as_str()))
        .expect("contributed near-duplicate entity");
    assert!(
        matches
            .iter()
            .any(|m| m.entity.id_persistent == existing_entity.id_persistent),
        "existing entity should be a match candidate"
    );

    duplicates
        .assign_duplicate(
            &alice,
            id,
            near_duplicate.id_persistent,
            Some(existing_entity.id_persistent),
        )
        .await
        .unwrap();
    duplicates.complete_entity_assignment(&alice, id).await.unwrap();

    // Stage: elimination, then automatic fast-forward of the column's merge
    // request into the target definition.
    duplicates.eliminate_duplicates(id).await.unwrap();

    assert_eq!(
        contributions.get_for_user(&alice, id).await.unwrap().state,
        ContributionState::Merged
    );

    // The duplicate's chain is gone.
    assert!(matches!(
        entities.most_recent(near_duplicate.id_persistent).await,
        Err(CurationError::NotFound(_))
    ));

    // The contributed values arrived at the target definition: 2.0 on the
    // surviving existing entity, 3.5 on the genuinely new (now detached) one.
    let arrived = instances.for_definition(height.id_persistent).await.unwrap();
    assert_eq!(arrived.len(), 2);
    let on_existing = arrived
        .iter()
        .find(|i| i.id_entity_persistent == existing_entity.id_persistent)
        .expect("value rewritten onto the existing entity");
    assert_eq!(on_existing.value.as_deref(), Some("2.0"));

    let new_instance = arrived
        .iter()
        .find(|i| i.id_entity_persistent != existing_entity.id_persistent)
        .unwrap();
    assert_eq!(new_instance.value.as_deref(), Some("3.5"));
    let new_entity = entities
        .most_recent(new_instance.id_entity_persistent)
        .await
        .unwrap();
    assert_eq!(new_entity.id_contribution, None);

    // The hidden working child under the target is disabled after the merge.
    let children = tag_defs.children(Some(height.id_persistent)).await.unwrap();
    assert!(children.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_late_conflict_resolution_completes_the_contribution() {
    let pool = get_shared_pool().await;
    let queue = null_queue();
    let cache = memory_cache();

    let entities = EntityStore::new(pool.clone(), queue.clone(), cache.clone());
    let tag_defs = TagDefStore::new(pool.clone(), queue.clone(), cache.clone());
    let tag_merges = TagMergeStore::new(pool.clone(), queue.clone(), cache.clone());

    let alice = UserRef::new(unique("alice"), PermissionGroup::Contributor);
    let (height, _) = tag_defs
        .change_or_create(
            Uuid::new_v4(),
            None,
            TagDefDraft::new(unique("height"), TagType::Float, Some(alice.name.clone())),
        )
        .await
        .unwrap();

    // The destination already carries a value, so the contribution's merge
    // request cannot fast-forward and parks in conflicts.
    let (bystander, _) = entities
        .change_or_create(
            Uuid::new_v4(),
            None,
            EntityDraft {
                display_txt: Some(unique("bystander")),
                ..EntityDraft::default()
            },
        )
        .await
        .unwrap();
    let instances = TagInstanceStore::new(pool.clone(), queue.clone(), cache.clone());
    instances
        .change_or_create(
            Uuid::new_v4(),
            None,
            TagInstanceDraft {
                id_entity_persistent: bystander.id_persistent,
                id_tag_definition_persistent: height.id_persistent,
                value: Some("1.0".into()),
            },
        )
        .await
        .unwrap();

    let upload_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        upload_dir.path().join("late.csv"),
        format!("{},2.0\n", unique("late arrival")),
    )
    .unwrap();
    let storage = StorageConfig {
        upload_dir: upload_dir.path().to_path_buf(),
    };
    let pipeline = ContributionPipeline::new(pool.clone(), queue.clone(), cache.clone(), storage);
    let duplicates = DuplicateStore::new(pool.clone(), queue.clone(), cache.clone());
    let contributions = pipeline.contributions();

    let contribution = contributions
        .create(&alice, &unique("late"), "", "late.csv", false)
        .await
        .unwrap();
    let id = contribution.id_persistent;
    pipeline.extract_columns(id).await.unwrap();
    contributions
        .patch_column(&alice, id, 0, Some(ColumnTarget::DisplayTxt), false)
        .await
        .unwrap();
    contributions
        .patch_column(
            &alice,
            id,
            1,
            Some(ColumnTarget::Existing {
                id_persistent: height.id_persistent,
            }),
            false,
        )
        .await
        .unwrap();
    contributions.complete_assignment(&alice, id).await.unwrap();
    pipeline.ingest_values(id).await.unwrap();
    duplicates.candidates_for_contribution(&alice, id).await.unwrap();
    duplicates.complete_entity_assignment(&alice, id).await.unwrap();
    duplicates.eliminate_duplicates(id).await.unwrap();

    // The merge request parked; the contribution waits on it.
    let request = tag_merges
        .list_by_assignee(&alice.name)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.id_contribution == Some(id))
        .expect("contribution-owned merge request");
    assert_eq!(request.state, MergeRequestState::Conflicts);
    assert_eq!(
        contributions.get_for_user(&alice, id).await.unwrap().state,
        ContributionState::ValuesAssigned
    );

    // Resolving the conflict later still completes the contribution.
    let conflicts = tag_merges.conflicts(request.id_persistent).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    tag_merges
        .record_resolution(
            &alice,
            request.id_persistent,
            conflicts[0].id_entity_persistent,
            true,
        )
        .await
        .unwrap();
    tag_merges
        .set_resolved(&alice, request.id_persistent)
        .await
        .unwrap();
    tag_merges
        .resolve(request.id_persistent, &alice)
        .await
        .unwrap();

    assert_eq!(
        tag_merges.get(request.id_persistent).await.unwrap().state,
        MergeRequestState::Merged
    );
    assert_eq!(
        contributions.get_for_user(&alice, id).await.unwrap().state,
        ContributionState::Merged
    );
}

#[tokio::test]
#[ignore]
async fn test_header_toggle_reruns_extraction() {
    let pool = get_shared_pool().await;
    let queue = null_queue();
    let cache = memory_cache();

    let alice = UserRef::new(unique("alice"), PermissionGroup::Contributor);

    let upload_dir = tempfile::tempdir().unwrap();
    std::fs::write(upload_dir.path().join("data.csv"), "name,height\nacme,2.0\n").unwrap();
    let storage = StorageConfig {
        upload_dir: upload_dir.path().to_path_buf(),
    };
    let pipeline = ContributionPipeline::new(pool.clone(), queue.clone(), cache.clone(), storage);
    let contributions = pipeline.contributions();

    let contribution = contributions
        .create(&alice, &unique("toggle"), "", "data.csv", false)
        .await
        .unwrap();
    let id = contribution.id_persistent;
    pipeline.extract_columns(id).await.unwrap();
    assert_eq!(contributions.columns(id).await.unwrap().len(), 2);

    // Flipping the header flag drops the columns and re-queues extraction.
    let patched = contributions
        .patch(
            &alice,
            id,
            tagmere::contribution::ContributionPatch {
                has_header: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(patched.has_header);
    assert_eq!(
        contributions.get_for_user(&alice, id).await.unwrap().state,
        ContributionState::Uploaded
    );

    pipeline.extract_columns(id).await.unwrap();
    let columns = contributions.columns(id).await.unwrap();
    assert_eq!(
        columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["name", "height"]
    );
}

#[tokio::test]
#[ignore]
async fn test_missing_file_rolls_back_with_error() {
    let pool = get_shared_pool().await;
    let queue = null_queue();
    let cache = memory_cache();

    let alice = UserRef::new(unique("alice"), PermissionGroup::Contributor);
    let upload_dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        upload_dir: upload_dir.path().to_path_buf(),
    };
    let pipeline = ContributionPipeline::new(pool.clone(), queue.clone(), cache.clone(), storage);
    let contributions = pipeline.contributions();

    let contribution = contributions
        .create(&alice, &unique("lost"), "", "nowhere.csv", false)
        .await
        .unwrap();
    let id = contribution.id_persistent;

    assert!(pipeline.extract_columns(id).await.is_err());

    let after = contributions.get_for_user(&alice, id).await.unwrap();
    assert_eq!(after.state, ContributionState::Uploaded);
    assert!(after.error_msg.is_some());
}
