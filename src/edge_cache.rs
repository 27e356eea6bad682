use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::async_trait;
use dashmap::DashMap;
use log::trace;
use tokio::time::Instant;

use crate::store::{KeyValueStore, ReadOptions, StoreError};

#[derive(Clone)]
struct CachedValue {
    value: String,
    fetched_at: Instant,
    expires_at: Instant,
}

// expired copies of keys nobody reads again are dropped at most this often
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Honors the freshness window of reads on top of another `KeyValueStore`,
/// the way an edge location caches values of a global key value namespace.
///
/// Only values that exist and were read with a window are cached, and a copy
/// is dropped once the window it was fetched with has passed. Writes go
/// straight through and leave cached copies untouched, so a read with a window
/// may return the value that was current when it was fetched. A read without
/// any window always reaches the inner store and caches nothing.
#[derive(Clone)]
pub struct EdgeCachedStore<S>
where S: KeyValueStore
{
    inner: S,
    cached: Arc<DashMap<String, CachedValue>>,
    default_ttl: Option<Duration>,
    last_sweep: Arc<Mutex<Instant>>,
}

impl <S> EdgeCachedStore<S>
where S: KeyValueStore
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cached: Arc::new(DashMap::new()),
            default_ttl: None,
            last_sweep: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Window applied to reads that don't bring their own.
    pub fn with_default_ttl(mut self, default_ttl: Option<Duration>) -> Self {
        self.default_ttl = default_ttl;
        self
    }

    fn effective_ttl(&self, options: &ReadOptions) -> Option<Duration> {
        options.cache_ttl
        .or(self.default_ttl)
        .filter(|ttl|!ttl.is_zero())
    }

    fn cache(&self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        self.cached.insert(key.to_string(), CachedValue { value: value.to_string(), fetched_at: now, expires_at: now + ttl });
        self.sweep(now);
    }

    fn sweep(&self, now: Instant) {
        let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };
        if now.duration_since(*last_sweep) < SWEEP_INTERVAL {
            return;
        }
        *last_sweep = now;
        let before = self.cached.len();
        self.cached.retain(|_, c|c.expires_at > now);
        trace!("swept {} expired edge cache entries", before.saturating_sub(self.cached.len()));
    }
}

#[async_trait]
impl <S> KeyValueStore for EdgeCachedStore<S>
where S: KeyValueStore
{
    async fn get(&self, key: &str, options: ReadOptions) -> Result<Option<String>, StoreError> {
        let ttl = self.effective_ttl(&options);
        if let Some(ttl) = ttl {
            let hit = self.cached
            .get(key)
            .filter(|c|c.fetched_at.elapsed() < ttl)
            .map(|c|c.value.clone());
            if hit.is_some() {
                trace!("serving '{key}' from edge cache");
                return Ok(hit);
            }
            let now = Instant::now();
            self.cached.remove_if(key, |_, c|c.expires_at <= now);
        }

        let value = self.inner.get(key, options).await?;
        match (&value, ttl) {
            (Some(v), Some(ttl)) => self.cache(key, v, ttl),
            (Some(_), None) => {}
            (None, _) => {
                self.cached.remove(key);
            }
        }
        Ok(value)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }
}

#[cfg(test)]
use crate::memory_store::MemoryStore;

#[tokio::test(start_paused = true)]
async fn test_window_permits_stale_read() {
    let origin = MemoryStore::new();
    let edge = EdgeCachedStore::new(origin.clone());
    let window = ReadOptions::with_cache_ttl(Duration::from_secs(60));

    edge.put("k", "v1".to_string()).await.unwrap();
    assert_eq!(edge.get("k", window).await.unwrap().as_deref(), Some("v1"));

    edge.put("k", "v2".to_string()).await.unwrap();
    assert_eq!(edge.get("k", window).await.unwrap().as_deref(), Some("v1"));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(edge.get("k", window).await.unwrap().as_deref(), Some("v2"));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_window_reads_own_writes() {
    let edge = EdgeCachedStore::new(MemoryStore::new());
    let window = ReadOptions::with_cache_ttl(Duration::from_secs(60));

    edge.put("k", "v1".to_string()).await.unwrap();
    assert_eq!(edge.get("k", window).await.unwrap().as_deref(), Some("v1"));
    edge.put("k", "v2".to_string()).await.unwrap();

    assert_eq!(edge.get("k", ReadOptions::default()).await.unwrap().as_deref(), Some("v2"));
    // the uncached read left the edge copy alone
    assert_eq!(edge.get("k", window).await.unwrap().as_deref(), Some("v1"));
}

#[tokio::test(start_paused = true)]
async fn test_default_ttl_applies_without_window() {
    let edge = EdgeCachedStore::new(MemoryStore::new())
    .with_default_ttl(Some(Duration::from_secs(30)));

    edge.put("k", "v1".to_string()).await.unwrap();
    assert_eq!(edge.get("k", ReadOptions::default()).await.unwrap().as_deref(), Some("v1"));
    edge.put("k", "v2".to_string()).await.unwrap();
    assert_eq!(edge.get("k", ReadOptions::default()).await.unwrap().as_deref(), Some("v1"));

    // an explicit zero window bypasses the default
    let bypass = ReadOptions::with_cache_ttl(Duration::ZERO);
    assert_eq!(edge.get("k", bypass).await.unwrap().as_deref(), Some("v2"));
}

#[tokio::test(start_paused = true)]
async fn test_absent_values_are_not_cached() {
    let edge = EdgeCachedStore::new(MemoryStore::new());
    let window = ReadOptions::with_cache_ttl(Duration::from_secs(60));

    assert_eq!(edge.get("k", window).await.unwrap(), None);
    edge.put("k", "v1".to_string()).await.unwrap();
    assert_eq!(edge.get("k", window).await.unwrap().as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_reads_without_window_cache_nothing() {
    let edge = EdgeCachedStore::new(MemoryStore::new());

    for i in 0..1000 {
        let key = format!("data-10.0.{}.{}", i / 256, i % 256);
        edge.put(&key, format!("v{i}")).await.unwrap();
        assert_eq!(edge.get(&key, ReadOptions::default()).await.unwrap(), Some(format!("v{i}")));
    }
    assert!(edge.cached.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expired_copies_are_dropped() {
    let edge = EdgeCachedStore::new(MemoryStore::new());
    let window = ReadOptions::with_cache_ttl(Duration::from_secs(10));

    edge.put("a", "1".to_string()).await.unwrap();
    edge.put("b", "2".to_string()).await.unwrap();
    edge.get("a", window).await.unwrap();
    assert_eq!(edge.cached.len(), 1);

    // "a" is never read again, the next insert after the sweep interval drops it
    tokio::time::advance(SWEEP_INTERVAL).await;
    edge.get("b", window).await.unwrap();
    assert_eq!(edge.cached.len(), 1);
    assert!(edge.cached.contains_key("b"));

    // an expired copy looked up again is replaced by a fresh one
    tokio::time::advance(Duration::from_secs(11)).await;
    edge.put("b", "3".to_string()).await.unwrap();
    assert_eq!(edge.get("b", window).await.unwrap().as_deref(), Some("3"));
    assert_eq!(edge.cached.len(), 1);
}
