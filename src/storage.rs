//! The storage contract (spec §6): a pluggable key-value store with
//! `get`/`set`/`delete`/`entries(prefix)`/`clear`, and the ability to spawn
//! named sub-instances (`hdwallet`, `state`, `address`, `unspent`,
//! `provider_cache`). The concrete engine (sqlite, rocksdb, ...) is an
//! external collaborator; this module defines the trait plus an in-memory
//! implementation used by tests and as a development default, grounded on
//! the teacher's choice to make wallet state `Serialize`/`Deserialize` and
//! on `zallet`'s pooled-storage layering (kept minimal here since an
//! in-memory store needs no connection pool).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>);
    async fn delete(&self, key: &str);
    /// All `(key, value)` pairs whose key starts with `prefix`.
    async fn entries(&self, prefix: &str) -> Vec<(String, Vec<u8>)>;
    async fn clear(&self);
    /// A named sub-instance restricted to keys under `"{name}/"`.
    fn scope(&self, name: &str) -> Arc<dyn KvStore>;
}

/// `BTreeMap`-backed in-memory [`KvStore`].
#[derive(Default)]
pub struct MemoryStore {
    prefix: String,
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { prefix: String::new(), data: Arc::new(RwLock::new(BTreeMap::new())) })
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().await.get(&self.full_key(key)).cloned()
    }

    async fn set(&self, key: &str, value: Vec<u8>) {
        self.data.write().await.insert(self.full_key(key), value);
    }

    async fn delete(&self, key: &str) {
        self.data.write().await.remove(&self.full_key(key));
    }

    async fn entries(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let full_prefix = self.full_key(prefix);
        self.data
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(&full_prefix))
            .map(|(k, v)| {
                let stripped = if self.prefix.is_empty() {
                    k.clone()
                } else {
                    k.strip_prefix(&format!("{}/", self.prefix)).unwrap_or(k).to_string()
                };
                (stripped, v.clone())
            })
            .collect()
    }

    async fn clear(&self) {
        let full_prefix = if self.prefix.is_empty() { String::new() } else { format!("{}/", self.prefix) };
        self.data.write().await.retain(|k, _| !k.starts_with(&full_prefix));
    }

    fn scope(&self, name: &str) -> Arc<dyn KvStore> {
        let prefix = if self.prefix.is_empty() { name.to_string() } else { format!("{}/{name}", self.prefix) };
        Arc::new(MemoryStore { prefix, data: Arc::clone(&self.data) })
    }
}

/// Serializes `value` as JSON and persists it under `key`.
pub async fn put_json<T: serde::Serialize>(store: &dyn KvStore, key: &str, value: &T) {
    let bytes = serde_json::to_vec(value).expect("serialization of wallet state never fails");
    store.set(key, bytes).await;
}

/// Reads and deserializes a JSON value previously stored with [`put_json`].
pub async fn get_json<T: serde::de::DeserializeOwned>(store: &dyn KvStore, key: &str) -> Option<T> {
    let bytes = store.get(key).await?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_stores_are_isolated_but_share_backing_map() {
        let root = MemoryStore::new();
        let a = root.scope("address");
        let b = root.scope("unspent");
        a.set("k", b"a".to_vec()).await;
        b.set("k", b"b".to_vec()).await;
        assert_eq!(a.get("k").await, Some(b"a".to_vec()));
        assert_eq!(b.get("k").await, Some(b"b".to_vec()));
        assert_eq!(root.entries("").await.len(), 2);
    }

    #[tokio::test]
    async fn entries_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("addr:1", b"x".to_vec()).await;
        store.set("addr:2", b"y".to_vec()).await;
        store.set("other", b"z".to_vec()).await;
        let found = store.entries("addr:").await;
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn clear_only_removes_own_scope() {
        let root = MemoryStore::new();
        let a = root.scope("a");
        let b = root.scope("b");
        a.set("k", b"1".to_vec()).await;
        b.set("k", b"2".to_vec()).await;
        a.clear().await;
        assert_eq!(a.get("k").await, None);
        assert_eq!(b.get("k").await, Some(b"2".to_vec()));
    }
}
