//! Subscription multiplexing
//!
//! Many watchers of one identifier share a single store subscription. The
//! subscription outlives its last watcher by a grace period, so a watcher
//! that comes back quickly (a re-render, a remount) reuses it.
//!
//! ```text
//!   watch ──► refcount 0→1 ──► store.subscribe
//!   watch ──► refcount n→n+1 (cancels a pending teardown)
//! unwatch ──► refcount 1→0 ──► timer(grace) ──► store.unsubscribe
//! ```

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::Result;
use crate::store::{ChangeCallback, DocId, StoreHandle, StoredValue, ValueStore};

pub type WatchCallback = Arc<dyn Fn(&StoredValue) + Send + Sync>;

#[derive(Default)]
struct SubscriptionRecord {
    refcount: usize,
    /// `None` only between insertion and the first store subscribe.
    store_handle: Option<StoreHandle>,
    callbacks: Vec<(u64, WatchCallback)>,
    cleanup: Option<JoinHandle<()>>,
    /// Bumped on every refcount change; a timer only tears down the
    /// generation it was armed for.
    generation: u64,
    /// Set once the store subscription is gone. A retired record is never
    /// revived; watchers that raced with teardown start a fresh one.
    retired: bool,
}

type RecordRef = Arc<Mutex<SubscriptionRecord>>;

fn lock(record: &Mutex<SubscriptionRecord>) -> MutexGuard<'_, SubscriptionRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SubscriptionMultiplexer {
    store: Arc<dyn ValueStore>,
    grace_period: Duration,
    /// Held only to look up, insert or remove a record. All refcount and
    /// callback mutation happens under the record's own lock.
    records: Mutex<HashMap<DocId, RecordRef>>,
    next_callback: AtomicU64,
}

impl SubscriptionMultiplexer {
    pub fn new(store: Arc<dyn ValueStore>, grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            grace_period,
            records: Mutex::new(HashMap::new()),
            next_callback: AtomicU64::new(1),
        })
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    fn record(&self, id: &DocId) -> Option<RecordRef> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn record_or_insert(&self, id: &DocId) -> RecordRef {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_default()
            .clone()
    }

    /// Drop the map entry for `id` if it is still `record`.
    fn forget(&self, id: &DocId, record: &RecordRef) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.get(id).map_or(false, |r| Arc::ptr_eq(r, record)) {
            records.remove(id);
        }
    }

    /// Start watching `id`. The returned guard unwatches when dropped.
    ///
    /// The store subscription is opened under the record lock, so concurrent
    /// first watchers cannot open two.
    pub fn watch(self: &Arc<Self>, id: &DocId, callback: WatchCallback) -> Result<WatchGuard> {
        let callback_id = self.next_callback.fetch_add(1, Ordering::SeqCst);
        loop {
            let record = self.record_or_insert(id);
            let mut state = lock(&record);
            if state.retired {
                drop(state);
                self.forget(id, &record);
                continue;
            }
            if state.store_handle.is_none() {
                match self.store.subscribe(id, self.fanout(id.clone(), &record)) {
                    Ok(handle) => {
                        log::debug!("subscribed to {} ({})", id, handle);
                        state.store_handle = Some(handle);
                    }
                    Err(e) => {
                        if state.callbacks.is_empty() {
                            state.retired = true;
                            drop(state);
                            self.forget(id, &record);
                        }
                        return Err(e.into());
                    }
                }
            }
            if let Some(timer) = state.cleanup.take() {
                timer.abort();
                log::debug!("reusing subscription to {} within grace period", id);
            }
            state.generation += 1;
            state.refcount += 1;
            state.callbacks.push((callback_id, callback));
            return Ok(WatchGuard {
                multiplexer: Arc::downgrade(self),
                id: id.clone(),
                callback_id,
                released: AtomicBool::new(false),
            });
        }
    }

    fn fanout(&self, id: DocId, record: &RecordRef) -> ChangeCallback {
        let record: Weak<Mutex<SubscriptionRecord>> = Arc::downgrade(record);
        Arc::new(move |value: &StoredValue| {
            let Some(record) = record.upgrade() else {
                return;
            };
            // Snapshot so callbacks can watch and unwatch freely.
            let callbacks: Vec<WatchCallback> = {
                let state = lock(&record);
                if state.retired {
                    return;
                }
                state.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
            };
            for callback in callbacks {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                    log::error!("watch callback for {} panicked", id);
                }
            }
        })
    }

    fn release(self: &Arc<Self>, id: &DocId, callback_id: u64) {
        let Some(record) = self.record(id) else {
            return;
        };
        let mut state = lock(&record);
        let before = state.callbacks.len();
        state.callbacks.retain(|(cid, _)| *cid != callback_id);
        if state.callbacks.len() == before {
            return;
        }
        state.refcount -= 1;
        state.generation += 1;
        if state.refcount > 0 {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !self.grace_period.is_zero() => {
                let generation = state.generation;
                let grace = self.grace_period;
                let weak = Arc::downgrade(self);
                let key = id.clone();
                state.cleanup = Some(runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(multiplexer) = weak.upgrade() {
                        multiplexer.expire(&key, generation);
                    }
                }));
            }
            _ => {
                self.retire(id, &mut state);
                drop(state);
                self.forget(id, &record);
            }
        }
    }

    fn retire(&self, id: &DocId, state: &mut SubscriptionRecord) {
        state.retired = true;
        state.callbacks.clear();
        if let Some(timer) = state.cleanup.take() {
            timer.abort();
        }
        if let Some(handle) = state.store_handle.take() {
            self.store.unsubscribe(id, handle);
            log::debug!("unsubscribed from {}", id);
        }
    }

    fn expire(&self, id: &DocId, generation: u64) {
        let Some(record) = self.record(id) else {
            return;
        };
        let mut state = lock(&record);
        if state.retired || state.refcount > 0 || state.generation != generation {
            return;
        }
        // The timer is this task; dropping its handle does not cancel it.
        state.cleanup = None;
        self.retire(id, &mut state);
        drop(state);
        self.forget(id, &record);
    }

    /// Tear down the subscription to `id` now, whatever its refcount.
    /// Outstanding guards become inert.
    pub fn evict(&self, id: &DocId) {
        let Some(record) = self.record(id) else {
            return;
        };
        let mut state = lock(&record);
        if state.retired {
            return;
        }
        let watchers = state.refcount;
        state.refcount = 0;
        self.retire(id, &mut state);
        drop(state);
        self.forget(id, &record);
        log::debug!("evicted subscription to {} ({} watchers)", id, watchers);
    }

    pub fn refcount(&self, id: &DocId) -> usize {
        self.record(id).map_or(0, |r| lock(&r).refcount)
    }

    pub fn store_handle(&self, id: &DocId) -> Option<StoreHandle> {
        self.record(id).and_then(|r| lock(&r).store_handle)
    }

    /// Whether a store subscription to `id` is open (watched or in grace).
    pub fn is_live(&self, id: &DocId) -> bool {
        self.store_handle(id).is_some()
    }

    pub fn active(&self) -> Vec<DocId> {
        let records: Vec<(DocId, RecordRef)> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        let mut ids: Vec<DocId> = records
            .into_iter()
            .filter(|(_, r)| lock(r).store_handle.is_some())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }
}

/// A live watch. Dropping it unwatches.
pub struct WatchGuard {
    multiplexer: Weak<SubscriptionMultiplexer>,
    id: DocId,
    callback_id: u64,
    released: AtomicBool,
}

impl WatchGuard {
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Idempotent.
    pub fn unwatch(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.release(&self.id, self.callback_id);
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.unwatch();
    }
}

impl std::fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGuard")
            .field("id", &self.id)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}
