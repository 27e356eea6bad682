use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;

/// Per-read options passed through to the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Freshness window: how long a previously fetched value may be served
    /// again before the store has to consult authoritative storage.
    /// `None` means the store's own default policy applies.
    pub cache_ttl: Option<Duration>,
}

impl ReadOptions {
    pub fn with_cache_ttl(cache_ttl: Duration) -> Self {
        Self { cache_ttl: Some(cache_ttl) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key value store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("stored value for '{0}' is not valid UTF-8")]
    InvalidValue(String),
}

/// Define an abstract key value store using `str` keys and UTF-8 string values.
///
/// The goal is to decouple store implementations (in memory, postgres, ...)
/// from the places where they are used (e.g. the todo list handler).
/// `put` always replaces the whole value.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str, options: ReadOptions) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;
}

#[async_trait]
impl <S> KeyValueStore for Arc<S>
where S: KeyValueStore + ?Sized
{
    async fn get(&self, key: &str, options: ReadOptions) -> Result<Option<String>, StoreError> {
        (**self).get(key, options).await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        (**self).put(key, value).await
    }
}

/// Store handle shared by all requests.
pub type SharedStore = Arc<dyn KeyValueStore>;
