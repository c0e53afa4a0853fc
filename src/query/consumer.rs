//! Consumers: observable state with declared queries

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::QueryDescriptor;
use crate::error::{Result, WeftError};
use crate::multiplexer::WatchGuard;
use crate::resolver::LoadState;
use crate::store::DocId;

/// Lifecycle of an attached consumer.
///
/// ```text
/// Uninitialized ─attach─► Scanning ─► Subscribed ⇄ Updating
///                                          │
///                                       detach ─► TornDown
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsumerPhase {
    Uninitialized,
    Scanning,
    Subscribed,
    /// Has changes waiting for the next flush.
    Updating,
    TornDown,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySlot {
    pub descriptor: QueryDescriptor,
    pub load_state: LoadState,
    pub data: Value,
}

/// One field of a consumer's state. Only `Query` slots are observed.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Slot {
    Value(Value),
    Query(QuerySlot),
}

impl Slot {
    pub fn data(&self) -> &Value {
        match self {
            Slot::Value(v) => v,
            Slot::Query(q) => &q.data,
        }
    }
}

/// Initial state handed to [`Consumer::new`].
#[derive(Clone, Debug, Default)]
pub struct ConsumerState {
    slots: BTreeMap<String, Slot>,
}

impl ConsumerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.slots.insert(key.into(), Slot::Value(value));
        self
    }

    pub fn query(mut self, key: impl Into<String>, descriptor: QueryDescriptor) -> Self {
        self.slots.insert(
            key.into(),
            Slot::Query(QuerySlot {
                descriptor,
                load_state: LoadState::Loading,
                data: Value::Null,
            }),
        );
        self
    }
}

/// Handed to the renderer once per flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderBatch {
    pub consumer: Uuid,
    /// Keys whose data differs from the last render.
    pub keys: BTreeSet<String>,
}

/// Watches held for one query slot.
#[derive(Default)]
pub(crate) struct Tracking {
    /// Watch on the document, or the schema collection. Only held.
    pub _root: Option<WatchGuard>,
    pub filter: Option<BTreeMap<String, Value>>,
    /// Collection order.
    pub members: Vec<DocId>,
    pub member_guards: HashMap<DocId, WatchGuard>,
    pub items: HashMap<DocId, Value>,
}

type Renderer = Box<dyn Fn(&RenderBatch) + Send + Sync>;

pub struct Consumer {
    id: Uuid,
    phase: Mutex<ConsumerPhase>,
    slots: Mutex<BTreeMap<String, Slot>>,
    /// Data as of the last render, per key.
    rendered: Mutex<BTreeMap<String, Value>>,
    tracking: Mutex<HashMap<String, Tracking>>,
    renderer: Renderer,
    renders: AtomicUsize,
}

impl Consumer {
    pub fn new(
        state: ConsumerState,
        renderer: impl Fn(&RenderBatch) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            phase: Mutex::new(ConsumerPhase::Uninitialized),
            slots: Mutex::new(state.slots),
            rendered: Mutex::new(BTreeMap::new()),
            tracking: Mutex::new(HashMap::new()),
            renderer: Box::new(renderer),
            renders: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> ConsumerPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: ConsumerPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    pub fn is_torn_down(&self) -> bool {
        self.phase() == ConsumerPhase::TornDown
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tracking(&self) -> MutexGuard<'_, HashMap<String, Tracking>> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slot(&self, key: &str) -> Option<Slot> {
        self.slots().get(key).cloned()
    }

    /// Current data of `key`: the plain value, or the query result.
    pub fn data(&self, key: &str) -> Option<Value> {
        self.slots().get(key).map(|s| s.data().clone())
    }

    pub fn load_state(&self, key: &str) -> Option<LoadState> {
        match self.slots().get(key)? {
            Slot::Query(q) => Some(q.load_state),
            Slot::Value(_) => None,
        }
    }

    /// Set a plain value slot. Query slots are owned by the engine.
    pub fn set_value(&self, key: &str, value: Value) {
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(Slot::Query(_)) => log::warn!("ignoring write to query slot {}", key),
            Some(Slot::Value(v)) => *v = value,
            None => {
                slots.insert(key.to_string(), Slot::Value(value));
            }
        }
    }

    /// Number of times the renderer has run.
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_scan(&self) -> Result<Vec<(String, QueryDescriptor)>> {
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase != ConsumerPhase::Uninitialized {
                return Err(WeftError::invalid_op(format!(
                    "consumer {} cannot attach while {:?}",
                    self.id, *phase
                )));
            }
            *phase = ConsumerPhase::Scanning;
        }
        // Shallow: only top-level slots are considered.
        Ok(self
            .slots()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Query(q) => Some((key.clone(), q.descriptor.clone())),
                Slot::Value(_) => None,
            })
            .collect())
    }

    /// Record the current data as rendered and start accepting updates.
    pub(crate) fn finish_attach(&self) {
        let baseline: BTreeMap<String, Value> = self
            .slots()
            .iter()
            .map(|(k, s)| (k.clone(), s.data().clone()))
            .collect();
        *self.rendered.lock().unwrap_or_else(PoisonError::into_inner) = baseline;
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == ConsumerPhase::Scanning {
            *phase = ConsumerPhase::Subscribed;
        }
    }

    #[cfg(test)]
    pub(crate) fn force_subscribed(&self) {
        self.set_phase(ConsumerPhase::Scanning);
        self.finish_attach();
    }

    /// Store a query result. Returns whether the slot changed.
    pub(crate) fn store_result(&self, key: &str, data: Value, load_state: LoadState) -> bool {
        if self.is_torn_down() {
            return false;
        }
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(Slot::Query(q)) => {
                if q.data == data && q.load_state == load_state {
                    return false;
                }
                q.data = data;
                q.load_state = load_state;
                true
            }
            _ => false,
        }
    }

    /// Note pending changes.
    pub(crate) fn touch(&self) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == ConsumerPhase::Subscribed {
            *phase = ConsumerPhase::Updating;
        }
    }

    /// Render whatever in `keys` differs from the last render. Returns
    /// whether the renderer ran.
    pub(crate) fn render(&self, keys: BTreeSet<String>) -> bool {
        if self.is_torn_down() {
            return false;
        }
        let changed: BTreeSet<String> = {
            let slots = self.slots();
            let mut rendered = self.rendered.lock().unwrap_or_else(PoisonError::into_inner);
            keys.into_iter()
                .filter(|key| {
                    let current = slots.get(key).map(Slot::data);
                    if current == rendered.get(key) {
                        return false;
                    }
                    if let Some(current) = current {
                        rendered.insert(key.clone(), current.clone());
                    }
                    true
                })
                .collect()
        };
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase == ConsumerPhase::Updating {
                *phase = ConsumerPhase::Subscribed;
            }
        }
        if changed.is_empty() {
            log::trace!("consumer {} net-unchanged, render skipped", self.id);
            return false;
        }

        let batch = RenderBatch {
            consumer: self.id,
            keys: changed,
        };
        self.renders.fetch_add(1, Ordering::SeqCst);
        if panic::catch_unwind(AssertUnwindSafe(|| (self.renderer)(&batch))).is_err() {
            log::error!("renderer of consumer {} panicked", self.id);
        }
        true
    }

    /// Install the watches for `key`. A torn-down consumer refuses them and
    /// they come back to the caller to drop.
    pub(crate) fn track(&self, key: &str, tracking: Tracking) -> Option<Tracking> {
        let mut tracked = self.tracking();
        if self.is_torn_down() {
            return Some(tracking);
        }
        tracked.insert(key.to_string(), tracking);
        None
    }

    /// Mark torn down and hand back every watch for the caller to drop.
    ///
    /// The phase flips under the tracking lock, so a concurrent `track`
    /// either lands before the drain or is refused.
    pub(crate) fn tear_down(&self) -> Vec<Tracking> {
        let mut tracked = self.tracking();
        self.set_phase(ConsumerPhase::TornDown);
        tracked.drain().map(|(_, t)| t).collect()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}
