use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::error::AppError;
use crate::traits::DocumentStore;

type Collections = HashMap<String, BTreeMap<String, Value>>;

/// In-process document store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Collections> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned memory store mutex");
            poisoned.into_inner()
        })
    }

    /// Number of documents in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.lock_inner().get(collection).map_or(0, BTreeMap::len)
    }
}

impl DocumentStore for MemoryStore {
    async fn put(&self, collection: &str, id: &str, document: &Value) -> Result<(), AppError> {
        self.lock_inner()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, AppError> {
        Ok(self
            .lock_inner()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, AppError> {
        Ok(self
            .lock_inner()
            .get_mut(collection)
            .is_some_and(|docs| docs.remove(id).is_some()))
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>, AppError> {
        Ok(self
            .lock_inner()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("c", "1", &json!({"a": 1})).await.unwrap();
        store.put("c", "1", &json!({"a": 2})).await.unwrap();
        assert_eq!(store.count("c"), 1);
        assert_eq!(store.get("c", "1").await.unwrap(), Some(json!({"a": 2})));
        assert_eq!(store.get("other", "1").await.unwrap(), None);

        assert!(store.delete("c", "1").await.unwrap());
        assert!(!store.delete("c", "1").await.unwrap());
        assert!(store.list("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let store = MemoryStore::new();
        let clone = store.clone();
        clone.put("c", "x", &json!(true)).await.unwrap();
        assert_eq!(store.list("c").await.unwrap(), vec![json!(true)]);
    }
}
