//! Opaque key-value cache.
//!
//! Cached values (display texts, tag name paths) are best-effort: they are not
//! transactionally tied to the primary store, and every reader has a correct
//! fallback for a missing entry. Errors inside an implementation must degrade
//! to "absent", never surface.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value);
    async fn delete(&self, key: &str);
}

/// In-process cache backed by a map. The default for the worker binary and
/// tests; deployments with several workers plug in a shared store instead.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Value) {
        self.entries.write().await.insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k").await, None);

        cache.set("k", json!({"v": 1})).await;
        assert_eq!(cache.get("k").await, Some(json!({"v": 1})));

        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }
}
