//! Background task dispatch.
//!
//! Long-running pipeline steps never run inside a request: callers enqueue a
//! [`Task`] and return. Delivery is at-least-once; every handler tolerates
//! re-runs because repeated `change_or_create` calls either no-op on identical
//! payloads or fail harmlessly on stale versions, and stage transitions are
//! guarded compare-and-swap updates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::UserRef;
use crate::error::Result;

pub mod outbox;
pub mod worker;

pub use outbox::PgTaskQueue;
pub use worker::Worker;

/// A unit of deferred work. Identity is captured at enqueue time so access
/// checks inside handlers see the user who triggered the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    ExtractColumns {
        id_contribution: Uuid,
    },
    IngestValues {
        id_contribution: Uuid,
    },
    EliminateDuplicates {
        id_contribution: Uuid,
    },
    FastForwardTagMerge {
        id_request: Uuid,
        requester: UserRef,
    },
    ResolveTagMerge {
        id_request: Uuid,
        requester: UserRef,
    },
    ApplyEntityMerge {
        id_request: Uuid,
        requester: UserRef,
    },
    RefreshDisplayTxt {
        id_entity_persistent: Uuid,
    },
    RefreshNamePath {
        id_tag_definition_persistent: Uuid,
    },
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<()>;
}

/// Queue that drops everything. For unit tests and synchronous callers that
/// refresh caches themselves.
pub struct NullQueue;

#[async_trait]
impl TaskQueue for NullQueue {
    async fn enqueue(&self, _task: Task) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PermissionGroup;

    #[test]
    fn test_task_payload_roundtrip() {
        let task = Task::FastForwardTagMerge {
            id_request: Uuid::new_v4(),
            requester: UserRef::new("alice", PermissionGroup::Editor),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "fast_forward_tag_merge");
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
