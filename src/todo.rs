use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache_fronted::{CacheError, CacheFrontedStore, LogicalKey};
use crate::store::{KeyValueStore, ReadOptions};

/// Document stored per client, e.g. `{"todos":[{"id":1,"name":"milk","completed":false}]}`.
///
/// Writes are only checked for JSON syntax, so stored documents are served
/// as generic JSON values; this type describes the expected layout and
/// produces the default.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TodoList {
    pub todos: Vec<Todo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Todo {
    pub id: i64,
    pub name: String,
    pub completed: bool,
}

pub const DEFAULT_TODOS: &str = r#"{"todos":[]}"#;

/// Todo document of the client at `address`, created empty on first access.
pub(super) async fn get_todos<S>(cfs: &CacheFrontedStore<S>, address: IpAddr, options: ReadOptions) -> Result<Value, CacheError>
where S: KeyValueStore
{
    let key = LogicalKey::for_client(address);
    cfs.ensure_default_with(&key, DEFAULT_TODOS, options).await
}

/// Replaces the todo document of the client at `address` with `body`.
pub(super) async fn put_todos<S>(cfs: &CacheFrontedStore<S>, address: IpAddr, body: String) -> Result<(), CacheError>
where S: KeyValueStore
{
    let key = LogicalKey::for_client(address);
    cfs.write(&key, body).await
}

#[test]
fn test_default_matches_empty_list() {
    let parsed: TodoList = serde_json::from_str(DEFAULT_TODOS).unwrap();
    assert_eq!(parsed, TodoList::default());
    assert_eq!(serde_json::to_string(&TodoList::default()).unwrap(), DEFAULT_TODOS);
}

#[cfg(test)]
use crate::memory_store::MemoryStore;

#[tokio::test]
async fn test_clients_get_separate_lists() {
    let cfs = CacheFrontedStore::new(MemoryStore::new());
    let alice: IpAddr = "1.2.3.4".parse().unwrap();
    let bob: IpAddr = "5.6.7.8".parse().unwrap();

    put_todos(&cfs, alice, r#"{"todos":[{"id":1,"name":"milk","completed":false}]}"#.to_string()).await.unwrap();

    let alice_todos: TodoList = serde_json::from_value(get_todos(&cfs, alice, ReadOptions::default()).await.unwrap()).unwrap();
    let bob_todos: TodoList = serde_json::from_value(get_todos(&cfs, bob, ReadOptions::default()).await.unwrap()).unwrap();

    assert_eq!(alice_todos.todos, vec![Todo { id: 1, name: "milk".to_string(), completed: false }]);
    assert_eq!(bob_todos, TodoList::default());
}
