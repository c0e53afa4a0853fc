use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use weft::query::ConsumerPhase;
use weft::store::{ChangeCallback, StoreError, StoreHandle};
use weft::{
    Consumer, ConsumerState, DataLayer, DocId, FlushMode, LayerConfig, MemoryStore,
    QueryDescriptor, SchemaId, StorageKind, StoredValue, ValueStore,
};

/// A `MemoryStore` whose loads can be made to suspend, the way a replicated
/// store does while it fetches from peers.
#[derive(Default)]
struct SlowStore {
    inner: MemoryStore,
    /// One-shot delays for the next load of an id.
    slow: Mutex<HashMap<DocId, Duration>>,
    /// When set, values created meanwhile get a one-shot delay.
    slow_creates: Mutex<Option<Duration>>,
}

impl SlowStore {
    fn delay_next_load(&self, id: &DocId, delay: Duration) {
        self.slow.lock().unwrap().insert(id.clone(), delay);
    }

    fn delay_created(&self, delay: Option<Duration>) {
        *self.slow_creates.lock().unwrap() = delay;
    }
}

#[async_trait]
impl ValueStore for SlowStore {
    async fn load(&self, id: &DocId) -> Result<Option<StoredValue>, StoreError> {
        let delay = self.slow.lock().unwrap().remove(id);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.load(id).await
    }

    async fn create(
        &self,
        kind: StorageKind,
        schema_id: Option<&DocId>,
        data: Value,
    ) -> Result<DocId, StoreError> {
        let id = self.inner.create(kind, schema_id, data).await?;
        let delay = *self.slow_creates.lock().unwrap();
        if let Some(delay) = delay {
            self.delay_next_load(&id, delay);
        }
        Ok(id)
    }

    async fn write(&self, id: &DocId, value: StoredValue) -> Result<(), StoreError> {
        self.inner.write(id, value).await
    }

    fn subscribe(&self, id: &DocId, on_change: ChangeCallback) -> Result<StoreHandle, StoreError> {
        self.inner.subscribe(id, on_change)
    }

    fn unsubscribe(&self, id: &DocId, handle: StoreHandle) {
        self.inner.unsubscribe(id, handle)
    }
}

const SLOW: Duration = Duration::from_millis(100);

async fn setup() -> (Arc<SlowStore>, Arc<DataLayer>, SchemaId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(SlowStore::default());
    let config = LayerConfig {
        flush: FlushMode::Manual,
        ..LayerConfig::default()
    };
    let layer = Arc::new(DataLayer::new(store.clone(), config).await.unwrap());
    let todo = layer
        .execute_json(json!({
            "op": "registerSchema",
            "name": "Todo",
            "definition": {
                "kind": "map",
                "fields": {"text": {"valueType": "string"}, "done": {"valueType": "boolean"}}
            }
        }))
        .await
        .unwrap()
        .id()
        .cloned()
        .unwrap();
    (store, layer, todo)
}

async fn create(layer: &DataLayer, todo: &SchemaId, text: &str) -> DocId {
    layer
        .execute_json(json!({
            "op": "create",
            "schemaId": todo.as_str(),
            "data": {"text": text, "done": false}
        }))
        .await
        .unwrap()
        .id()
        .cloned()
        .unwrap()
}

fn consumer(descriptor: QueryDescriptor) -> Arc<Consumer> {
    Consumer::new(ConsumerState::new().query("todos", descriptor), |_| {})
}

fn spawn_attach(
    layer: &Arc<DataLayer>,
    consumer: &Arc<Consumer>,
) -> tokio::task::JoinHandle<weft::Result<()>> {
    let layer = layer.clone();
    let consumer = consumer.clone();
    tokio::spawn(async move { layer.attach(&consumer).await })
}

fn slot_ids(consumer: &Consumer) -> Vec<String> {
    consumer
        .data("todos")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|item| item["id"].as_str().map(String::from))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_detach_during_document_attach_releases_watch() {
    let (store, layer, todo) = setup().await;
    let id = create(&layer, &todo, "a").await;
    store.delay_next_load(&id, SLOW);

    let consumer = consumer(QueryDescriptor::document(todo, id.clone()));
    let attaching = spawn_attach(&layer, &consumer);
    tokio::time::sleep(Duration::from_millis(10)).await;
    layer.detach(&consumer);

    attaching.await.unwrap().unwrap();
    assert_eq!(consumer.phase(), ConsumerPhase::TornDown);
    assert_eq!(layer.multiplexer().refcount(&id), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!layer.multiplexer().is_live(&id));
}

#[tokio::test(start_paused = true)]
async fn test_detach_during_schema_attach_releases_watches() {
    let (store, layer, todo) = setup().await;
    let a = create(&layer, &todo, "a").await;
    let collection = layer.schemas().collection_for(&todo).await.unwrap();
    store.delay_next_load(&a, SLOW);

    let consumer = consumer(QueryDescriptor::schema(todo));
    let attaching = spawn_attach(&layer, &consumer);
    tokio::time::sleep(Duration::from_millis(10)).await;
    layer.detach(&consumer);

    attaching.await.unwrap().unwrap();
    assert_eq!(layer.multiplexer().refcount(&collection), 0);
    assert_eq!(layer.multiplexer().refcount(&a), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(layer.multiplexer().active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_member_created_during_attach_is_tracked() {
    let (store, layer, todo) = setup().await;
    let a = create(&layer, &todo, "a").await;
    store.delay_next_load(&a, SLOW);

    let consumer = consumer(QueryDescriptor::schema(todo.clone()));
    let attaching = spawn_attach(&layer, &consumer);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let b = create(&layer, &todo, "b").await;

    attaching.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(slot_ids(&consumer), vec![a.as_str(), b.as_str()]);
    assert_eq!(layer.multiplexer().refcount(&b), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_membership_change_does_not_undo_newer_one() {
    let (store, layer, todo) = setup().await;
    let a = create(&layer, &todo, "a").await;
    let consumer = consumer(QueryDescriptor::schema(todo.clone()));
    layer.attach(&consumer).await.unwrap();

    store.delay_created(Some(SLOW));
    let b = create(&layer, &todo, "b").await;
    store.delay_created(None);
    let c = create(&layer, &todo, "c").await;

    tokio::time::sleep(SLOW * 2).await;
    layer.flush();

    assert_eq!(slot_ids(&consumer), vec![a.as_str(), b.as_str(), c.as_str()]);
    assert_eq!(layer.multiplexer().refcount(&b), 1);
    assert_eq!(layer.multiplexer().refcount(&c), 1);

    // Later member updates still reach the slot.
    layer
        .execute_json(json!({
            "op": "update",
            "target": {"id": c.as_str()},
            "changes": {"done": true}
        }))
        .await
        .unwrap();
    assert_eq!(consumer.data("todos").unwrap()[2]["data"]["done"], true);
}
