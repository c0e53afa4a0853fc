//! Declarative queries
//!
//! A consumer declares the data it needs as [`Slot::Query`] entries. On
//! `attach` the engine reads a snapshot for each, then keeps the slot current
//! through the multiplexer: a document query watches one value; a schema
//! query watches the schema's collection plus every member.
//!
//! Incoming data is compared structurally against what the slot holds.
//! Unchanged data is dropped; anything else updates the slot and queues the
//! consumer for the next flush.

mod consumer;
mod scheduler;

pub use consumer::{Consumer, ConsumerPhase, ConsumerState, QuerySlot, RenderBatch, Slot};
pub use scheduler::FlushScheduler;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use consumer::Tracking;

use crate::dispatcher::{Dispatcher, Operation};
use crate::error::{Result, WeftError};
use crate::multiplexer::{SubscriptionMultiplexer, WatchCallback};
use crate::resolver::{LoadState, ResolvedView};
use crate::schema::SchemaId;
use crate::store::{DocId, StoredValue};

/// What a query slot observes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    pub schema_ref: SchemaId,
    /// One document; `None` selects every value of the schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DocId>,
    /// Field equality filter for schema queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<BTreeMap<String, Value>>,
}

impl QueryDescriptor {
    pub fn schema(schema_ref: SchemaId) -> Self {
        Self {
            schema_ref,
            target: None,
            filter: None,
        }
    }

    pub fn document(schema_ref: SchemaId, target: DocId) -> Self {
        Self {
            schema_ref,
            target: Some(target),
            filter: None,
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, equals: Value) -> Self {
        self.filter
            .get_or_insert_with(BTreeMap::new)
            .insert(field.into(), equals);
        self
    }
}

fn matches(filter: &Option<BTreeMap<String, Value>>, item: &Value) -> bool {
    filter
        .iter()
        .flatten()
        .all(|(field, expected)| item["data"].get(field) == Some(expected))
}

/// Current result of a schema query: member items in collection order.
fn compose(tracking: &Tracking) -> Value {
    let mut seen = HashSet::new();
    Value::Array(
        tracking
            .members
            .iter()
            .filter(|m| seen.insert(*m))
            .filter_map(|m| tracking.items.get(m))
            .filter(|item| matches(&tracking.filter, item))
            .cloned()
            .collect(),
    )
}

fn member_ids(data: &Value) -> Vec<DocId> {
    data.as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter_map(|s| DocId::parse(s).ok())
        .collect()
}

/// Orders membership changes of one schema query.
///
/// Each collection change is stamped as it arrives. Reconciliation runs
/// under `applied`, one at a time, and a change older than the last applied
/// one is dropped, so a slow reconcile never undoes a newer membership.
#[derive(Default)]
struct MembershipSync {
    seen: AtomicU64,
    applied: tokio::sync::Mutex<u64>,
}

pub struct QueryEngine {
    dispatcher: Arc<Dispatcher>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    scheduler: Arc<FlushScheduler>,
}

impl QueryEngine {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        multiplexer: Arc<SubscriptionMultiplexer>,
        scheduler: Arc<FlushScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            multiplexer,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &Arc<FlushScheduler> {
        &self.scheduler
    }

    /// Snapshot every query slot of `consumer` and start watching.
    ///
    /// A `detach` that lands while this is in flight wins: whatever was
    /// watched so far is released and attach returns early.
    pub async fn attach(self: &Arc<Self>, consumer: &Arc<Consumer>) -> Result<()> {
        let queries = consumer.begin_scan()?;
        for (key, descriptor) in queries {
            let started = match &descriptor.target {
                Some(target) => self.start_document(consumer, &key, target).await,
                None => self.start_schema(consumer, &key, &descriptor).await,
            };
            if let Err(e) = started {
                log::warn!("attaching consumer {} failed at {}: {}", consumer.id(), key, e);
                self.detach(consumer);
                return Err(e);
            }
            if consumer.is_torn_down() {
                log::debug!("consumer {} detached during attach", consumer.id());
                return Ok(());
            }
        }
        consumer.finish_attach();
        log::debug!("attached consumer {}", consumer.id());
        Ok(())
    }

    /// Unwatch everything `consumer` holds. Safe to call at any time.
    pub fn detach(&self, consumer: &Arc<Consumer>) {
        let released = consumer.tear_down();
        self.scheduler.forget(consumer.id());
        drop(released);
        log::debug!("detached consumer {}", consumer.id());
    }

    pub fn flush(&self) -> usize {
        self.scheduler.flush()
    }

    async fn snapshot(&self, id: &DocId) -> Result<ResolvedView> {
        self.dispatcher
            .execute(Operation::read(id.clone()))
            .await?
            .into_view()
            .ok_or_else(|| WeftError::invalid_op("read returned no view"))
    }

    fn publish(&self, consumer: &Arc<Consumer>, key: &str, data: Value, load_state: LoadState) {
        if consumer.store_result(key, data, load_state) {
            consumer.touch();
            self.scheduler.mark(consumer, key);
        }
    }

    async fn start_document(
        self: &Arc<Self>,
        consumer: &Arc<Consumer>,
        key: &str,
        target: &DocId,
    ) -> Result<()> {
        let guard = self
            .multiplexer
            .watch(target, self.document_callback(consumer, key, target))?;
        let view = self.snapshot(target).await?;
        consumer.store_result(key, view.to_json(), view.load_state);
        let tracking = Tracking {
            _root: Some(guard),
            ..Tracking::default()
        };
        if let Some(refused) = consumer.track(key, tracking) {
            drop(refused);
        }
        Ok(())
    }

    fn document_callback(self: &Arc<Self>, consumer: &Arc<Consumer>, key: &str, id: &DocId) -> WatchCallback {
        let engine: Weak<Self> = Arc::downgrade(self);
        let consumer: Weak<Consumer> = Arc::downgrade(consumer);
        let key = key.to_string();
        let id = id.clone();
        Arc::new(move |stored: &StoredValue| {
            let (Some(engine), Some(consumer)) = (engine.upgrade(), consumer.upgrade()) else {
                return;
            };
            let view = ResolvedView::from_stored(id.clone(), stored);
            engine.publish(&consumer, &key, view.to_json(), LoadState::Loaded);
        })
    }

    /// The collection is watched before it is read, and tracking is installed
    /// before any member is read, so membership changes during attach are
    /// reconciled once attach releases the ordering guard.
    async fn start_schema(
        self: &Arc<Self>,
        consumer: &Arc<Consumer>,
        key: &str,
        descriptor: &QueryDescriptor,
    ) -> Result<()> {
        let collection = self
            .dispatcher
            .schemas()
            .collection_for(&descriptor.schema_ref)
            .await?;
        let sync = Arc::new(MembershipSync::default());
        let root = self
            .multiplexer
            .watch(&collection, self.collection_callback(consumer, key, &sync))?;

        let mut applied = sync.applied.lock().await;
        let stamp = sync.seen.load(Ordering::SeqCst);
        let members = member_ids(&self.snapshot(&collection).await?.data());

        let tracking = Tracking {
            _root: Some(root),
            filter: descriptor.filter.clone(),
            ..Tracking::default()
        };
        if let Some(refused) = consumer.track(key, tracking) {
            drop(refused);
            return Ok(());
        }
        if let Some(data) = self.reconcile(consumer, key, members).await? {
            consumer.store_result(key, data, LoadState::Loaded);
        }
        *applied = stamp;
        Ok(())
    }

    fn member_callback(self: &Arc<Self>, consumer: &Arc<Consumer>, key: &str, member: &DocId) -> WatchCallback {
        let engine: Weak<Self> = Arc::downgrade(self);
        let consumer: Weak<Consumer> = Arc::downgrade(consumer);
        let key = key.to_string();
        let member = member.clone();
        Arc::new(move |stored: &StoredValue| {
            let (Some(engine), Some(consumer)) = (engine.upgrade(), consumer.upgrade()) else {
                return;
            };
            let item = ResolvedView::from_stored(member.clone(), stored).to_json();
            let data = {
                let mut tracking = consumer.tracking();
                let Some(tracked) = tracking.get_mut(&key) else {
                    return;
                };
                if tracked.items.get(&member) == Some(&item) {
                    return;
                }
                tracked.items.insert(member.clone(), item);
                compose(tracked)
            };
            engine.publish(&consumer, &key, data, LoadState::Loaded);
        })
    }

    /// Membership changes are handled on a later scheduling turn; watching
    /// from inside a fan-out is not allowed.
    fn collection_callback(
        self: &Arc<Self>,
        consumer: &Arc<Consumer>,
        key: &str,
        sync: &Arc<MembershipSync>,
    ) -> WatchCallback {
        let engine: Weak<Self> = Arc::downgrade(self);
        let consumer: Weak<Consumer> = Arc::downgrade(consumer);
        // Owned by the callback, which lives as long as the collection watch.
        let sync = sync.clone();
        let key = key.to_string();
        Arc::new(move |stored: &StoredValue| {
            let (Some(engine), Some(consumer)) = (engine.upgrade(), consumer.upgrade()) else {
                return;
            };
            let stamp = sync.seen.fetch_add(1, Ordering::SeqCst) + 1;
            let members = member_ids(&stored.data);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let key = key.clone();
                    let sync = sync.clone();
                    runtime.spawn(async move {
                        engine.resync(consumer, key, sync, members, stamp).await
                    });
                }
                Err(_) => log::warn!("no async runtime; membership change of {} dropped", key),
            }
        })
    }

    async fn resync(
        self: Arc<Self>,
        consumer: Arc<Consumer>,
        key: String,
        sync: Arc<MembershipSync>,
        members: Vec<DocId>,
        stamp: u64,
    ) {
        let mut applied = sync.applied.lock().await;
        if stamp <= *applied {
            log::trace!("membership change {} of {} superseded", stamp, key);
            return;
        }
        match self.reconcile(&consumer, &key, members).await {
            Ok(Some(data)) => {
                *applied = stamp;
                drop(applied);
                self.publish(&consumer, &key, data, LoadState::Loaded);
            }
            Ok(None) => {}
            Err(e) => log::warn!("membership change of {} not applied: {}", key, e),
        }
    }

    /// Bring the tracking of `key` in line with `members`: watch and read the
    /// new ones, drop the stale ones. Returns the composed result, or `None`
    /// when the consumer went away meanwhile.
    ///
    /// Callers hold the query's `MembershipSync` guard.
    async fn reconcile(
        self: &Arc<Self>,
        consumer: &Arc<Consumer>,
        key: &str,
        members: Vec<DocId>,
    ) -> Result<Option<Value>> {
        let known: HashSet<DocId> = match consumer.tracking().get(key) {
            Some(tracked) => tracked.member_guards.keys().cloned().collect(),
            None => return Ok(None),
        };
        let mut fresh: Vec<DocId> = Vec::new();
        for member in &members {
            if !known.contains(member) && !fresh.contains(member) {
                fresh.push(member.clone());
            }
        }

        let mut added = Vec::with_capacity(fresh.len());
        for member in fresh {
            if consumer.is_torn_down() {
                return Ok(None);
            }
            let guard = self
                .multiplexer
                .watch(&member, self.member_callback(consumer, key, &member))?;
            let item = self.snapshot(&member).await?.to_json();
            added.push((member, guard, item));
        }

        let (data, released) = {
            let mut tracking = consumer.tracking();
            let Some(tracked) = tracking.get_mut(key) else {
                return Ok(None);
            };
            let mut released = Vec::new();
            for (member, guard, item) in added {
                tracked.items.entry(member.clone()).or_insert(item);
                if let Some(previous) = tracked.member_guards.insert(member, guard) {
                    released.push(previous);
                }
            }
            let current: HashSet<&DocId> = members.iter().collect();
            let stale: Vec<DocId> = tracked
                .member_guards
                .keys()
                .filter(|m| !current.contains(m))
                .cloned()
                .collect();
            for member in stale {
                tracked.items.remove(&member);
                if let Some(guard) = tracked.member_guards.remove(&member) {
                    released.push(guard);
                }
            }
            tracked.members = members;
            (compose(tracked), released)
        };
        drop(released);
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_item_data() {
        let filter = QueryDescriptor::schema(DocId::new_unchecked("val:todo"))
            .with_filter("done", json!(false))
            .filter;
        assert!(matches(&filter, &json!({"data": {"done": false, "text": "a"}})));
        assert!(!matches(&filter, &json!({"data": {"done": true}})));
        assert!(!matches(&filter, &json!({"data": null})));
        assert!(matches(&None, &json!({"data": null})));
    }

    #[test]
    fn test_compose_keeps_collection_order() {
        let a = DocId::new_unchecked("val:a");
        let b = DocId::new_unchecked("val:b");
        let tracking = Tracking {
            members: vec![b.clone(), a.clone(), b.clone()],
            items: [
                (a, json!({"id": "val:a", "data": {}})),
                (b, json!({"id": "val:b", "data": {}})),
            ]
            .into_iter()
            .collect(),
            ..Tracking::default()
        };
        let ids: Vec<Value> = compose(&tracking)
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("val:b"), json!("val:a")]);
    }

    #[test]
    fn test_descriptor_wire_shape() {
        let d: QueryDescriptor = serde_json::from_value(json!({
            "schemaRef": "val:todo",
            "filter": {"done": true}
        }))
        .unwrap();
        assert_eq!(d.target, None);
        assert_eq!(d.filter.unwrap()["done"], json!(true));
    }
}
