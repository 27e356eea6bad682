use serde_json::json;

use crate::cache_fronted::{CacheError, CacheFrontedStore, LogicalKey};
use crate::store::{KeyValueStore, ReadOptions};

const USER_KEY: &str = "user";
pub const DEFAULT_USER_NAME: &str = "MP";

fn user_key() -> Result<LogicalKey, CacheError> {
    LogicalKey::new(USER_KEY)
}

/// Stores `{"name": <name>}` as the demo user and returns the stored document.
pub(super) async fn set_user<S>(cfs: &CacheFrontedStore<S>, name: &str) -> Result<String, CacheError>
where S: KeyValueStore
{
    let user = json!({ "name": name }).to_string();
    cfs.write(&user_key()?, user.clone()).await?;
    Ok(user)
}

/// The demo user document as stored, if it was ever set.
pub(super) async fn get_user<S>(cfs: &CacheFrontedStore<S>) -> Result<Option<String>, CacheError>
where S: KeyValueStore
{
    cfs.read(&user_key()?, ReadOptions::default()).await
}

#[cfg(test)]
use crate::memory_store::MemoryStore;

#[tokio::test]
async fn test_set_then_get_user() {
    let cfs = CacheFrontedStore::new(MemoryStore::new());
    assert_eq!(get_user(&cfs).await.unwrap(), None);

    let stored = set_user(&cfs, "Ada \"the\" Countess").await.unwrap();
    assert_eq!(stored, r#"{"name":"Ada \"the\" Countess"}"#);
    assert_eq!(get_user(&cfs).await.unwrap(), Some(stored));
}
