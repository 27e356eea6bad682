use std::{sync::{Arc, RwLock}, collections::HashMap};

use axum::async_trait;
use anyhow::anyhow;

use crate::store::{KeyValueStore, ReadOptions, StoreError};

/// A `KeyValueStore` implementation backed by a HashMap.
///
/// Clones share the same data. The freshness hint is ignored, every read is
/// authoritative.
#[derive(Default, Clone)]
pub struct MemoryStore {
    store: Arc<RwLock<HashMap<String,String>>>
}
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|m|m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore
{
    async fn get(&self, key: &str, _options: ReadOptions) -> Result<Option<String>, StoreError> {
        let map = self.store.read()
        .map_err(|_|StoreError::Unavailable(anyhow!("memory store lock poisoned")))?;
        Ok(map.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut map = self.store.write()
        .map_err(|_|StoreError::Unavailable(anyhow!("memory store lock poisoned")))?;
        map.insert(key.to_string(), value);
        Ok(())
    }
}

#[tokio::test]
async fn test_put_replaces_value() {
    let store = MemoryStore::new();
    assert_eq!(store.get("user", ReadOptions::default()).await.unwrap(), None);

    store.put("user", r#"{"name":"MP"}"#.to_string()).await.unwrap();
    store.put("user", r#"{"name":"Ada"}"#.to_string()).await.unwrap();

    let shared = store.clone();
    assert_eq!(shared.get("user", ReadOptions::default()).await.unwrap().as_deref(), Some(r#"{"name":"Ada"}"#));
    assert_eq!(shared.len(), 1);
}
