//! Read-through access to per-key JSON documents held in a `KeyValueStore`.
//!
//! Documents are created lazily with a default on first read, replaced
//! wholesale on write, and never deleted here. Writes are only accepted if the
//! payload is well-formed JSON; the raw payload is what gets stored.
//!
//! There is no compare-and-swap: concurrent writers to one key race and the
//! last write to reach the store wins.

use std::fmt::Display;
use std::net::IpAddr;
use std::str::FromStr;

use anyhow::anyhow;
use log::{debug, error, trace};
use serde::de::{DeserializeOwned, IgnoredAny};

use crate::store::{KeyValueStore, ReadOptions, StoreError};

const GENERIC_VALIDATION_MESSAGE: &str = "payload is not valid JSON";

/// Key a document is stored under. Validated once, immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogicalKey(String);

impl LogicalKey {
    pub const MAX_LEN: usize = 512;

    pub fn new(key: impl Into<String>) -> Result<Self, CacheError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }
        if key.len() > Self::MAX_LEN {
            return Err(CacheError::InvalidKey(format!("key exceeds {} bytes", Self::MAX_LEN)));
        }
        if key.contains(['\r', '\n']) {
            return Err(CacheError::InvalidKey("key must not contain line breaks".to_string()));
        }
        Ok(Self(key))
    }

    /// Key of the document belonging to the client at `address`.
    pub fn for_client(address: IpAddr) -> Self {
        Self(format!("data-{address}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LogicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("{message}")]
    Validation { message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored entry '{key}' is not a valid document: {message}")]
    CorruptEntry { key: String, message: String },
}

/// What `ensure_default` does when the stored value cannot be parsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CorruptEntryPolicy {
    /// Fail the request, leave the entry as it is.
    #[default]
    Fail,
    /// Overwrite the entry with the default document.
    Reset,
}

impl FromStr for CorruptEntryPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "reset" => Ok(Self::Reset),
            other => Err(anyhow!("unknown corrupt entry policy '{other}', expected 'fail' or 'reset'")),
        }
    }
}

/// Checks that `raw` is well-formed JSON without building a document from it.
pub fn validate_payload(raw: &str) -> Result<(), CacheError> {
    serde_json::from_str::<IgnoredAny>(raw)
    .map(|_|())
    .map_err(|e|validation_error(&e))
}

fn validation_error(e: &serde_json::Error) -> CacheError {
    let message = e.to_string();
    let message = if message.trim().is_empty() {
        GENERIC_VALIDATION_MESSAGE.to_string()
    } else {
        message
    };
    CacheError::Validation { message }
}

/// Mediates reads and writes of per-key documents through a `KeyValueStore`.
///
/// The store is handed in by the caller, so any implementation (including a
/// fake in tests) can be used.
#[derive(Clone)]
pub struct CacheFrontedStore<S>
where S: KeyValueStore
{
    store: S,
    corrupt_entry_policy: CorruptEntryPolicy,
}

impl <S> CacheFrontedStore<S>
where S: KeyValueStore
{
    pub fn new(store: S) -> Self {
        Self { store, corrupt_entry_policy: CorruptEntryPolicy::default() }
    }

    pub fn with_corrupt_entry_policy(mut self, corrupt_entry_policy: CorruptEntryPolicy) -> Self {
        self.corrupt_entry_policy = corrupt_entry_policy;
        self
    }

    /// Raw stored value for `key`, or `None`. Never writes.
    pub async fn read(&self, key: &LogicalKey, options: ReadOptions) -> Result<Option<String>, CacheError> {
        trace!("reading '{key}' with {options:?}");
        Ok(self.store.get(key.as_str(), options).await?)
    }

    /// Returns the document stored under `key`, writing `default_raw` first if
    /// there is none. Once this returns `Ok`, an entry for `key` exists.
    pub async fn ensure_default<T>(&self, key: &LogicalKey, default_raw: &str) -> Result<T, CacheError>
    where T: DeserializeOwned + Send
    {
        self.ensure_default_with(key, default_raw, ReadOptions::default()).await
    }

    /// `ensure_default` with a freshness window for the initial read.
    pub async fn ensure_default_with<T>(&self, key: &LogicalKey, default_raw: &str, options: ReadOptions) -> Result<T, CacheError>
    where T: DeserializeOwned + Send
    {
        let raw = match self.read(key, options).await? {
            Some(raw) => raw,
            None => {
                debug!("no entry for '{key}', initializing with default");
                return self.store_default(key, default_raw).await;
            }
        };

        match serde_json::from_str::<T>(&raw) {
            Ok(document) => Ok(document),
            Err(e) => match self.corrupt_entry_policy {
                CorruptEntryPolicy::Fail => {
                    error!("entry '{key}' cannot be deserialized: {e}");
                    Err(CacheError::CorruptEntry { key: key.to_string(), message: e.to_string() })
                }
                CorruptEntryPolicy::Reset => {
                    error!("entry '{key}' cannot be deserialized ({e}), resetting to default...");
                    self.store_default(key, default_raw).await
                }
            },
        }
    }

    // the default is only parsed when it is about to be stored
    async fn store_default<T>(&self, key: &LogicalKey, default_raw: &str) -> Result<T, CacheError>
    where T: DeserializeOwned + Send
    {
        let default = serde_json::from_str::<T>(default_raw)
        .map_err(|e|validation_error(&e))?;
        self.store.put(key.as_str(), default_raw.to_string()).await?;
        Ok(default)
    }

    /// Replaces the value under `key` with `raw_payload`, if it is well-formed.
    /// Rejected payloads leave the store untouched.
    pub async fn write(&self, key: &LogicalKey, raw_payload: String) -> Result<(), CacheError> {
        if let Err(e) = validate_payload(&raw_payload) {
            debug!("rejected write to '{key}': {e}");
            return Err(e);
        }
        self.store.put(key.as_str(), raw_payload).await?;
        Ok(())
    }
}


#[cfg(test)]
use {
    crate::memory_store::MemoryStore,
    axum::async_trait,
    serde_json::{json, Value},
    std::sync::{Arc, atomic::{AtomicUsize, Ordering}},
};

#[cfg(test)]
#[derive(Clone, Default)]
struct CountingStore {
    inner: MemoryStore,
    puts: Arc<AtomicUsize>,
}

#[cfg(test)]
#[async_trait]
impl KeyValueStore for CountingStore {
    async fn get(&self, key: &str, options: ReadOptions) -> Result<Option<String>, StoreError> {
        self.inner.get(key, options).await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, value).await
    }
}

#[cfg(test)]
struct UnavailableStore;

#[cfg(test)]
#[async_trait]
impl KeyValueStore for UnavailableStore {
    async fn get(&self, _key: &str, _options: ReadOptions) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable(anyhow!("connection refused")))
    }

    async fn put(&self, _key: &str, _value: String) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(anyhow!("connection refused")))
    }
}

#[test]
fn test_logical_key() {
    assert!(LogicalKey::new("").is_err());
    assert!(LogicalKey::new("a\nb").is_err());
    assert!(LogicalKey::new("x".repeat(LogicalKey::MAX_LEN + 1)).is_err());
    assert_eq!(LogicalKey::new("user").unwrap().as_str(), "user");

    let v4 = LogicalKey::for_client("1.2.3.4".parse().unwrap());
    assert_eq!(v4.as_str(), "data-1.2.3.4");
    assert_eq!(v4, LogicalKey::for_client("1.2.3.4".parse().unwrap()));
    assert_ne!(v4, LogicalKey::for_client("1.2.3.5".parse().unwrap()));
    assert_eq!(LogicalKey::for_client("::1".parse().unwrap()).as_str(), "data-::1");
}

#[test]
fn test_corrupt_entry_policy_from_str() {
    assert_eq!("fail".parse::<CorruptEntryPolicy>().unwrap(), CorruptEntryPolicy::Fail);
    assert_eq!(" Reset ".parse::<CorruptEntryPolicy>().unwrap(), CorruptEntryPolicy::Reset);
    assert!("ignore".parse::<CorruptEntryPolicy>().is_err());
}

#[tokio::test]
async fn test_ensure_default_initializes_missing_entry() {
    let store = CountingStore::default();
    let cfs = CacheFrontedStore::new(store.clone());
    let key = LogicalKey::new("data-10.0.0.1").unwrap();

    let doc: Value = cfs.ensure_default(&key, r#"{"todos":[]}"#).await.unwrap();
    assert_eq!(doc, json!({"todos": []}));
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    assert_eq!(cfs.read(&key, ReadOptions::default()).await.unwrap().as_deref(), Some(r#"{"todos":[]}"#));
}

#[tokio::test]
async fn test_ensure_default_keeps_existing_entry() {
    let store = CountingStore::default();
    store.inner.put("data-10.0.0.1", r#"{"todos":[{"id":7,"name":"bread","completed":true}]}"#.to_string()).await.unwrap();
    let cfs = CacheFrontedStore::new(store.clone());
    let key = LogicalKey::new("data-10.0.0.1").unwrap();

    let doc: Value = cfs.ensure_default(&key, r#"{"todos":[]}"#).await.unwrap();
    assert_eq!(doc["todos"][0]["name"], "bread");
    assert_eq!(store.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_existing_entry_ignores_bad_default() {
    let store = CountingStore::default();
    store.inner.put("k", r#"{"todos":[]}"#.to_string()).await.unwrap();
    let cfs = CacheFrontedStore::new(store.clone());
    let key = LogicalKey::new("k").unwrap();

    let doc: Value = cfs.ensure_default(&key, "not json").await.unwrap();
    assert_eq!(doc, serde_json::json!({"todos": []}));
    assert_eq!(store.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ensure_default_rejects_bad_default() {
    let store = CountingStore::default();
    let cfs = CacheFrontedStore::new(store.clone());
    let key = LogicalKey::new("k").unwrap();

    let result = cfs.ensure_default::<Value>(&key, "{").await;
    assert!(matches!(result, Err(CacheError::Validation { .. })));
    assert_eq!(store.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_corrupt_entry_fails_by_default() {
    let store = MemoryStore::new();
    store.put("k", "{broken".to_string()).await.unwrap();
    let cfs = CacheFrontedStore::new(store.clone());
    let key = LogicalKey::new("k").unwrap();

    let result = cfs.ensure_default::<Value>(&key, r#"{"todos":[]}"#).await;
    assert!(matches!(result, Err(CacheError::CorruptEntry { .. })));
    assert_eq!(store.get("k", ReadOptions::default()).await.unwrap().as_deref(), Some("{broken"));
}

#[tokio::test]
async fn test_corrupt_entry_reset_policy() {
    let store = MemoryStore::new();
    store.put("k", "{broken".to_string()).await.unwrap();
    let cfs = CacheFrontedStore::new(store.clone())
    .with_corrupt_entry_policy(CorruptEntryPolicy::Reset);
    let key = LogicalKey::new("k").unwrap();

    let doc: Value = cfs.ensure_default(&key, r#"{"todos":[]}"#).await.unwrap();
    assert_eq!(doc, json!({"todos": []}));
    assert_eq!(store.get("k", ReadOptions::default()).await.unwrap().as_deref(), Some(r#"{"todos":[]}"#));
}

#[tokio::test]
async fn test_write_stores_payload_verbatim() {
    let cfs = CacheFrontedStore::new(MemoryStore::new());
    let key = LogicalKey::new("k").unwrap();
    // whitespace and key order survive because the raw string is stored
    let payload = "{ \"b\": 1,\n  \"a\": [true, null] }";

    cfs.write(&key, payload.to_string()).await.unwrap();
    assert_eq!(cfs.read(&key, ReadOptions::default()).await.unwrap().as_deref(), Some(payload));

    cfs.write(&key, payload.to_string()).await.unwrap();
    assert_eq!(cfs.read(&key, ReadOptions::default()).await.unwrap().as_deref(), Some(payload));
}

#[tokio::test]
async fn test_invalid_write_leaves_entry_unchanged() {
    let store = CountingStore::default();
    let cfs = CacheFrontedStore::new(store.clone());
    let key = LogicalKey::new("k").unwrap();
    cfs.write(&key, r#"{"todos":[]}"#.to_string()).await.unwrap();

    for payload in ["not json", "", "{\"todos\": [", "{} trailing"] {
        match cfs.write(&key, payload.to_string()).await {
            Err(CacheError::Validation { message }) => assert!(!message.is_empty()),
            other => panic!("expected validation error for {payload:?}, got {other:?}"),
        }
    }
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    assert_eq!(cfs.read(&key, ReadOptions::default()).await.unwrap().as_deref(), Some(r#"{"todos":[]}"#));
}

#[tokio::test]
async fn test_todo_lifecycle_for_client() {
    let cfs = CacheFrontedStore::new(MemoryStore::new());
    let key = LogicalKey::new("data-1.2.3.4").unwrap();
    assert_eq!(cfs.read(&key, ReadOptions::default()).await.unwrap(), None);

    let doc: Value = cfs.ensure_default(&key, r#"{"todos":[]}"#).await.unwrap();
    assert_eq!(doc, json!({"todos": []}));

    let payload = r#"{"todos":[{"id":1,"name":"milk","completed":false}]}"#;
    cfs.write(&key, payload.to_string()).await.unwrap();
    assert_eq!(cfs.read(&key, ReadOptions::default()).await.unwrap().as_deref(), Some(payload));
}

#[tokio::test]
async fn test_store_failures_propagate() {
    let cfs = CacheFrontedStore::new(UnavailableStore);
    let key = LogicalKey::new("k").unwrap();

    assert!(matches!(cfs.read(&key, ReadOptions::default()).await, Err(CacheError::Store(_))));
    assert!(matches!(cfs.ensure_default::<Value>(&key, "{}").await, Err(CacheError::Store(_))));
    assert!(matches!(cfs.write(&key, "{}".to_string()).await, Err(CacheError::Store(_))));
}
