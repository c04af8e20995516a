//! Integration tests for the merge engine, both flavors.
//!
//! Run with a test database:
//!   DATABASE_URL=postgresql://localhost/tagmere_test \
//!     cargo test --test merge_integration -- --ignored

mod common;

use uuid::Uuid;

use common::{get_shared_pool, memory_cache, null_queue, unique};
use tagmere::access::{PermissionGroup, UserRef};
use tagmere::merge::{EntityMergeStore, MergeRequestState, TagMergeStore};
use tagmere::store::entity::{EntityDraft, EntityStore};
use tagmere::store::tag_def::{TagDefDraft, TagDefRecord, TagDefStore, TagType};
use tagmere::store::tag_instance::{TagInstanceDraft, TagInstanceRecord, TagInstanceStore};

struct Fixture {
    entities: EntityStore,
    tag_defs: TagDefStore,
    instances: TagInstanceStore,
    tag_merges: TagMergeStore,
    entity_merges: EntityMergeStore,
    alice: UserRef,
}

impl Fixture {
    fn new(pool: &sqlx::PgPool) -> Self {
        let queue = null_queue();
        let cache = memory_cache();
        Self {
            entities: EntityStore::new(pool.clone(), queue.clone(), cache.clone()),
            tag_defs: TagDefStore::new(pool.clone(), queue.clone(), cache.clone()),
            instances: TagInstanceStore::new(pool.clone(), queue.clone(), cache.clone()),
            tag_merges: TagMergeStore::new(pool.clone(), queue.clone(), cache.clone()),
            entity_merges: EntityMergeStore::new(pool.clone(), queue, cache),
            alice: UserRef::new(unique("alice"), PermissionGroup::Contributor),
        }
    }

    async fn float_def(&self, prefix: &str) -> TagDefRecord {
        let (def, _) = self
            .tag_defs
            .change_or_create(
                Uuid::new_v4(),
                None,
                TagDefDraft::new(unique(prefix), TagType::Float, Some(self.alice.name.clone())),
            )
            .await
            .unwrap();
        def
    }

    async fn entity(&self, prefix: &str) -> Uuid {
        let (entity, _) = self
            .entities
            .change_or_create(
                Uuid::new_v4(),
                None,
                EntityDraft {
                    display_txt: Some(unique(prefix)),
                    ..EntityDraft::default()
                },
            )
            .await
            .unwrap();
        entity.id_persistent
    }

    async fn instance(&self, id_entity: Uuid, id_def: Uuid, value: &str) -> TagInstanceRecord {
        let (instance, _) = self
            .instances
            .change_or_create(
                Uuid::new_v4(),
                None,
                TagInstanceDraft {
                    id_entity_persistent: id_entity,
                    id_tag_definition_persistent: id_def,
                    value: Some(value.into()),
                },
            )
            .await
            .unwrap();
        instance
    }
}

// ----------------------------------------------------------------------------
// Tag merge requests
// ----------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_tag_merge_fast_forwards_into_empty_destination() {
    let pool = get_shared_pool().await;
    let f = Fixture::new(pool);

    let origin = f.float_def("origin").await;
    let destination = f.float_def("destination").await;
    let entity = f.entity("subject").await;
    f.instance(entity, origin.id_persistent, "1.0").await;

    let request = f
        .tag_merges
        .create(&f.alice, origin.id_persistent, destination.id_persistent)
        .await
        .unwrap();
    assert_eq!(request.assigned_to.as_deref(), Some(f.alice.name.as_str()));

    f.tag_merges
        .fast_forward(request.id_persistent, &f.alice)
        .await
        .unwrap();

    let merged = f.tag_merges.get(request.id_persistent).await.unwrap();
    assert_eq!(merged.state, MergeRequestState::Merged);

    let arrived = f
        .instances
        .for_definition(destination.id_persistent)
        .await
        .unwrap();
    assert_eq!(arrived.len(), 1);
    assert_eq!(arrived[0].id_entity_persistent, entity);
    assert_eq!(arrived[0].value.as_deref(), Some("1.0"));
}

#[tokio::test]
#[ignore]
async fn test_fast_forward_without_write_access_leaves_request_open() {
    let pool = get_shared_pool().await;
    let f = Fixture::new(pool);

    let origin = f.float_def("origin").await;
    let (destination, _) = f
        .tag_defs
        .change_or_create(
            Uuid::new_v4(),
            None,
            TagDefDraft::new(
                unique("destination"),
                TagType::Float,
                Some(unique("bob")),
            ),
        )
        .await
        .unwrap();
    let entity = f.entity("subject").await;
    f.instance(entity, origin.id_persistent, "1.0").await;
    // A populated destination would normally park the request in conflicts,
    // but a requester without write access must not change its state at all.
    f.instance(entity, destination.id_persistent, "2.0").await;

    let request = f
        .tag_merges
        .create(&f.alice, origin.id_persistent, destination.id_persistent)
        .await
        .unwrap();
    f.tag_merges
        .fast_forward(request.id_persistent, &f.alice)
        .await
        .unwrap();

    assert_eq!(
        f.tag_merges.get(request.id_persistent).await.unwrap().state,
        MergeRequestState::Open
    );
}

#[tokio::test]
#[ignore]
async fn test_tag_merge_conflict_resolution_replaces_destination_value() {
    let pool = get_shared_pool().await;
    let f = Fixture::new(pool);

    let origin = f.float_def("origin").await;
    let destination = f.float_def("destination").await;
    let entity = f.entity("subject").await;
    f.instance(entity, origin.id_persistent, "1.0").await;
    let dest_instance = f.instance(entity, destination.id_persistent, "2.0").await;

    let request = f
        .tag_merges
        .create(&f.alice, origin.id_persistent, destination.id_persistent)
        .await
        .unwrap();
    f.tag_merges
        .fast_forward(request.id_persistent, &f.alice)
        .await
        .unwrap();
    assert_eq!(
        f.tag_merges.get(request.id_persistent).await.unwrap().state,
        MergeRequestState::Conflicts
    );

    let conflicts = f.tag_merges.conflicts(request.id_persistent).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id_entity_persistent, entity);

    f.tag_merges
        .record_resolution(&f.alice, request.id_persistent, entity, true)
        .await
        .unwrap();
    f.tag_merges
        .set_resolved(&f.alice, request.id_persistent)
        .await
        .unwrap();
    f.tag_merges
        .resolve(request.id_persistent, &f.alice)
        .await
        .unwrap();

    assert_eq!(
        f.tag_merges.get(request.id_persistent).await.unwrap().state,
        MergeRequestState::Merged
    );
    let head = f
        .instances
        .most_recent(dest_instance.id_persistent)
        .await
        .unwrap();
    assert_eq!(head.value.as_deref(), Some("1.0"));
    assert_eq!(head.previous_version, Some(dest_instance.internal_id));
}

#[tokio::test]
#[ignore]
async fn test_stale_resolution_reopens_the_request() {
    let pool = get_shared_pool().await;
    let f = Fixture::new(pool);

    let origin = f.float_def("origin").await;
    let destination = f.float_def("destination").await;
    let entity = f.entity("subject").await;
    let origin_instance = f.instance(entity, origin.id_persistent, "1.0").await;
    f.instance(entity, destination.id_persistent, "2.0").await;

    let request = f
        .tag_merges
        .create(&f.alice, origin.id_persistent, destination.id_persistent)
        .await
        .unwrap();
    f.tag_merges
        .fast_forward(request.id_persistent, &f.alice)
        .await
        .unwrap();
    f.tag_merges
        .record_resolution(&f.alice, request.id_persistent, entity, true)
        .await
        .unwrap();

    // Someone edits the origin instance after the decision was recorded.
    f.instances
        .change_or_create(
            origin_instance.id_persistent,
            Some(origin_instance.internal_id),
            TagInstanceDraft {
                value: Some("9.0".into()),
                ..TagInstanceDraft::from_record(&origin_instance)
            },
        )
        .await
        .unwrap();

    f.tag_merges
        .set_resolved(&f.alice, request.id_persistent)
        .await
        .unwrap();
    f.tag_merges
        .resolve(request.id_persistent, &f.alice)
        .await
        .unwrap();

    // The stale decision is not applied; the request goes back to open.
    assert_eq!(
        f.tag_merges.get(request.id_persistent).await.unwrap().state,
        MergeRequestState::Open
    );
}

// ----------------------------------------------------------------------------
// Entity merge requests
// ----------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_entity_merge_applies_resolved_conflicts() {
    let pool = get_shared_pool().await;
    let f = Fixture::new(pool);

    let height = f.float_def("height").await;
    let origin = f.entity("origin").await;
    let destination = f.entity("destination").await;
    f.instance(origin, height.id_persistent, "2.0").await;
    f.instance(destination, height.id_persistent, "3.0").await;

    let request = f
        .entity_merges
        .create(&f.alice, origin, destination)
        .await
        .unwrap();

    let conflicts = f
        .entity_merges
        .instance_conflicts_all(request.id_persistent)
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].definition.id_persistent, height.id_persistent);

    f.entity_merges
        .record_resolution(&f.alice, request.id_persistent, height.id_persistent, true)
        .await
        .unwrap();
    f.entity_merges
        .set_resolved(&f.alice, request.id_persistent)
        .await
        .unwrap();
    f.entity_merges
        .apply(request.id_persistent, &f.alice)
        .await
        .unwrap();

    assert_eq!(
        f.entity_merges.get(request.id_persistent).await.unwrap().state,
        MergeRequestState::Merged
    );

    // The destination carries the origin's value; the origin is disabled.
    let on_destination = f.instances.for_entity(destination).await.unwrap();
    let height_value = on_destination
        .iter()
        .find(|i| i.id_tag_definition_persistent == height.id_persistent)
        .unwrap();
    assert_eq!(height_value.value.as_deref(), Some("2.0"));
    assert!(f.entities.most_recent(origin).await.unwrap().disabled);
}

#[tokio::test]
#[ignore]
async fn test_editing_referenced_entity_marks_resolution_updated() {
    let pool = get_shared_pool().await;
    let f = Fixture::new(pool);

    let height = f.float_def("height").await;
    let origin = f.entity("origin").await;
    let destination = f.entity("destination").await;
    f.instance(origin, height.id_persistent, "2.0").await;
    f.instance(destination, height.id_persistent, "3.0").await;

    let request = f
        .entity_merges
        .create(&f.alice, origin, destination)
        .await
        .unwrap();
    f.entity_merges
        .record_resolution(&f.alice, request.id_persistent, height.id_persistent, true)
        .await
        .unwrap();

    let partition = f
        .entity_merges
        .partition_resolutions(&f.alice, request.id_persistent)
        .await
        .unwrap();
    assert_eq!(partition.resolvable.len(), 1);
    assert!(partition.updated.is_empty());

    // Editing the destination entity invalidates the pinned decision.
    let head = f.entities.most_recent(destination).await.unwrap();
    f.entities
        .change_or_create(
            destination,
            Some(head.internal_id),
            EntityDraft {
                display_txt: Some(unique("renamed")),
                ..EntityDraft::from_record(&head)
            },
        )
        .await
        .unwrap();

    let partition = f
        .entity_merges
        .partition_resolutions(&f.alice, request.id_persistent)
        .await
        .unwrap();
    assert!(partition.resolvable.is_empty());
    assert_eq!(partition.updated.len(), 1);
    assert_eq!(
        partition.updated[0].id_tag_definition_persistent,
        height.id_persistent
    );
}

#[tokio::test]
#[ignore]
async fn test_swap_inverts_direction_and_resolutions() {
    let pool = get_shared_pool().await;
    let f = Fixture::new(pool);

    let height = f.float_def("height").await;
    let origin = f.entity("origin").await;
    let destination = f.entity("destination").await;
    f.instance(origin, height.id_persistent, "2.0").await;
    f.instance(destination, height.id_persistent, "3.0").await;

    let request = f
        .entity_merges
        .create(&f.alice, origin, destination)
        .await
        .unwrap();
    f.entity_merges
        .record_resolution(&f.alice, request.id_persistent, height.id_persistent, true)
        .await
        .unwrap();

    f.entity_merges
        .swap_origin_destination(&f.alice, request.id_persistent)
        .await
        .unwrap();

    let swapped = f.entity_merges.get(request.id_persistent).await.unwrap();
    assert_eq!(swapped.id_origin_persistent, destination);
    assert_eq!(swapped.id_destination_persistent, origin);

    // The decision keeps its meaning: "take the old origin's value" becomes
    // "keep the new destination", so replace flips and the version references
    // follow their rows. The resolution stays current and resolvable.
    let partition = f
        .entity_merges
        .partition_resolutions(&f.alice, request.id_persistent)
        .await
        .unwrap();
    assert!(partition.updated.is_empty());
    assert_eq!(partition.resolvable.len(), 1);
    assert!(!partition.resolvable[0].replace);
}

#[tokio::test]
#[ignore]
async fn test_entity_merge_degrades_unresolved_conflicts_into_child_tags() {
    let pool = get_shared_pool().await;
    let f = Fixture::new(pool);

    let height = f.float_def("height").await;
    let origin = f.entity("origin").await;
    let destination = f.entity("destination").await;
    f.instance(origin, height.id_persistent, "2.0").await;
    f.instance(destination, height.id_persistent, "3.0").await;

    let request = f
        .entity_merges
        .create(&f.alice, origin, destination)
        .await
        .unwrap();
    // Resolve nothing: the merge must still complete.
    f.entity_merges
        .set_resolved(&f.alice, request.id_persistent)
        .await
        .unwrap();
    f.entity_merges
        .apply(request.id_persistent, &f.alice)
        .await
        .unwrap();

    assert_eq!(
        f.entity_merges.get(request.id_persistent).await.unwrap().state,
        MergeRequestState::Merged
    );
    assert!(f.entities.most_recent(origin).await.unwrap().disabled);

    // The destination's own value is untouched.
    let on_destination = f.instances.for_entity(destination).await.unwrap();
    let own_value = on_destination
        .iter()
        .find(|i| i.id_tag_definition_persistent == height.id_persistent)
        .unwrap();
    assert_eq!(own_value.value.as_deref(), Some("3.0"));

    // A hidden working child under the definition carries the parked value,
    // and a follow-up tag merge request points it at the definition.
    let children = f.tag_defs.children(Some(height.id_persistent)).await.unwrap();
    let child = children
        .iter()
        .find(|c| c.hidden && c.name.contains("Merge Request"))
        .expect("hidden working child definition");

    let parked = f.instances.for_definition(child.id_persistent).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].id_entity_persistent, destination);
    assert_eq!(parked[0].value.as_deref(), Some("2.0"));

    let follow_ups = f.tag_merges.list_by_assignee(&f.alice.name).await.unwrap();
    let follow_up = follow_ups
        .iter()
        .find(|r| r.id_origin_persistent == child.id_persistent)
        .expect("follow-up tag merge request");
    assert_eq!(follow_up.id_destination_persistent, height.id_persistent);
    assert!(follow_up.disable_origin_on_merge);
    assert_eq!(follow_up.state, MergeRequestState::Open);
}
