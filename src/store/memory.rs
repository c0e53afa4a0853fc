//! In-memory value store
//!
//! A process-local [`ValueStore`] for tests and embedders that do not need
//! replication. Identifiers are derived from the created content plus a nonce,
//! so two creates of identical data still get distinct identities.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{ChangeCallback, DocId, StorageKind, StoreError, StoreHandle, StoredValue, ValueStore};

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(format!("store lock poisoned: {e}"))
}

/// Derive an identifier from the initial content.
fn derive_id(kind: StorageKind, data: &serde_json::Value) -> DocId {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(data.to_string().as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    let digest = hex::encode(hasher.finalize());
    DocId::new_unchecked(format!("val:{}", &digest[..32]))
}

pub struct MemoryStore {
    values: RwLock<HashMap<DocId, StoredValue>>,
    subscribers: RwLock<HashMap<DocId, Vec<(StoreHandle, ChangeCallback)>>>,
    /// Ids that behave as unreachable (simulated partition).
    unreachable: RwLock<HashSet<DocId>>,
    released: RwLock<Vec<DocId>>,
    subscribe_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
            released: RwLock::new(Vec::new()),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    /// Make `id` load as unavailable (or reachable again).
    pub fn set_reachable(&self, id: &DocId, reachable: bool) {
        if let Ok(mut unreachable) = self.unreachable.write() {
            if reachable {
                unreachable.remove(id);
            } else {
                unreachable.insert(id.clone());
            }
        }
    }

    /// Total number of `subscribe` calls served.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions on `id`.
    pub fn live_subscriptions(&self, id: &DocId) -> usize {
        self.subscribers
            .read()
            .map(|subs| subs.get(id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Ids passed to `release`, in call order.
    pub fn released(&self) -> Vec<DocId> {
        self.released.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_reachable(&self, id: &DocId) -> bool {
        self.unreachable
            .read()
            .map(|u| !u.contains(id))
            .unwrap_or(true)
    }

    fn notify(&self, id: &DocId, value: &StoredValue) {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let callbacks: Vec<ChangeCallback> = match self.subscribers.read() {
            Ok(subs) => subs
                .get(id)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(value);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValueStore for MemoryStore {
    async fn load(&self, id: &DocId) -> Result<Option<StoredValue>, StoreError> {
        if !self.is_reachable(id) {
            return Ok(None);
        }
        let values = self.values.read().map_err(poisoned)?;
        Ok(values.get(id).cloned())
    }

    async fn create(
        &self,
        kind: StorageKind,
        schema_id: Option<&DocId>,
        data: serde_json::Value,
    ) -> Result<DocId, StoreError> {
        let id = derive_id(kind, &data);
        let value = StoredValue::new(kind, schema_id.cloned(), data);
        self.values.write().map_err(poisoned)?.insert(id.clone(), value);
        log::debug!("created {} value {}", kind, id);
        Ok(id)
    }

    async fn write(&self, id: &DocId, value: StoredValue) -> Result<(), StoreError> {
        {
            let mut values = self.values.write().map_err(poisoned)?;
            if !values.contains_key(id) {
                return Err(StoreError::NotFound(id.clone()));
            }
            values.insert(id.clone(), value.clone());
        }
        self.notify(id, &value);
        Ok(())
    }

    fn subscribe(&self, id: &DocId, on_change: ChangeCallback) -> Result<StoreHandle, StoreError> {
        let handle = Uuid::new_v4();
        self.subscribers
            .write()
            .map_err(poisoned)?
            .entry(id.clone())
            .or_default()
            .push((handle, on_change));
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn unsubscribe(&self, id: &DocId, handle: StoreHandle) {
        if let Ok(mut subs) = self.subscribers.write() {
            if let Some(list) = subs.get_mut(id) {
                list.retain(|(h, _)| *h != handle);
                if list.is_empty() {
                    subs.remove(id);
                }
            }
        }
    }

    async fn release(&self, id: &DocId) {
        if let Ok(mut released) = self.released.write() {
            released.push(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_create_load_write() {
        let store = MemoryStore::new();
        let id = store
            .create(StorageKind::Map, None, serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert!(id.as_str().starts_with("val:"));
        assert!(DocId::is_valid(id.as_str()));

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.data["a"], 1);

        store
            .write(&id, loaded.with_data(serde_json::json!({"a": 2})))
            .await
            .unwrap();
        assert_eq!(store.load(&id).await.unwrap().unwrap().data["a"], 2);
    }

    #[tokio::test]
    async fn test_identical_creates_get_distinct_ids() {
        let store = MemoryStore::new();
        let a = store
            .create(StorageKind::Map, None, serde_json::json!({}))
            .await
            .unwrap();
        let b = store
            .create(StorageKind::Map, None, serde_json::json!({}))
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_write_unknown_id_fails() {
        let store = MemoryStore::new();
        let id = DocId::new_unchecked("val:missing");
        let err = store
            .write(&id, StoredValue::new(StorageKind::Map, None, serde_json::json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(id));
    }

    #[tokio::test]
    async fn test_subscribers_see_writes_until_unsubscribed() {
        let store = MemoryStore::new();
        let id = store
            .create(StorageKind::Map, None, serde_json::json!({}))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = store
            .subscribe(
                &id,
                Arc::new(move |v: &StoredValue| sink.lock().unwrap().push(v.data.clone())),
            )
            .unwrap();
        assert_eq!(store.subscribe_calls(), 1);
        assert_eq!(store.live_subscriptions(&id), 1);

        let current = store.load(&id).await.unwrap().unwrap();
        store
            .write(&id, current.with_data(serde_json::json!({"n": 1})))
            .await
            .unwrap();
        store.unsubscribe(&id, handle);
        store
            .write(&id, current.with_data(serde_json::json!({"n": 2})))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({"n": 1})]);
        assert_eq!(store.live_subscriptions(&id), 0);
    }

    #[tokio::test]
    async fn test_unreachable_loads_as_none() {
        let store = MemoryStore::new();
        let id = store
            .create(StorageKind::Map, None, serde_json::json!({}))
            .await
            .unwrap();
        store.set_reachable(&id, false);
        assert!(store.load(&id).await.unwrap().is_none());
        store.set_reachable(&id, true);
        assert!(store.load(&id).await.unwrap().is_some());
    }
}
