//! Batched re-render scheduling
//!
//! Dirty `(consumer, key)` pairs collect in a pending window. The window is
//! flushed exactly once: by a timer armed on the first mark (auto mode) or
//! by an explicit [`FlushScheduler::flush`] (manual mode).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use uuid::Uuid;

use super::consumer::Consumer;

#[derive(Default)]
struct Window {
    dirty: BTreeMap<Uuid, (Weak<Consumer>, BTreeSet<String>)>,
    /// Identifies the open window; a timer only flushes the window it was
    /// armed for.
    generation: u64,
    armed: bool,
}

pub struct FlushScheduler {
    window: Option<Duration>,
    pending: Mutex<Window>,
    flushes: AtomicUsize,
}

impl FlushScheduler {
    /// `window` is the auto-flush delay; `None` means manual flushing.
    pub fn new(window: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            window,
            pending: Mutex::new(Window::default()),
            flushes: AtomicUsize::new(0),
        })
    }

    fn pending(&self) -> MutexGuard<'_, Window> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark(self: &Arc<Self>, consumer: &Arc<Consumer>, key: &str) {
        let arm = {
            let mut window = self.pending();
            window
                .dirty
                .entry(consumer.id())
                .or_insert_with(|| (Arc::downgrade(consumer), BTreeSet::new()))
                .1
                .insert(key.to_string());
            match self.window {
                Some(delay) if !window.armed => {
                    window.armed = true;
                    Some((delay, window.generation))
                }
                _ => None,
            }
        };
        let Some((delay, generation)) = arm else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let weak = Arc::downgrade(self);
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.flush_window(Some(generation));
                    }
                });
            }
            Err(_) => {
                log::warn!("no async runtime; pending renders wait for an explicit flush");
                self.pending().armed = false;
            }
        }
    }

    /// Flush the open window now. Returns the number of consumers rendered.
    pub fn flush(&self) -> usize {
        self.flush_window(None)
    }

    fn flush_window(&self, generation: Option<u64>) -> usize {
        let dirty = {
            let mut window = self.pending();
            if generation.map_or(false, |g| g != window.generation) {
                return 0;
            }
            window.armed = false;
            window.generation += 1;
            std::mem::take(&mut window.dirty)
        };
        if dirty.is_empty() {
            return 0;
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let mut rendered = 0;
        for (_, (consumer, keys)) in dirty {
            if let Some(consumer) = consumer.upgrade() {
                if consumer.render(keys) {
                    rendered += 1;
                }
            }
        }
        log::debug!("flushed pending window ({} consumers rendered)", rendered);
        rendered
    }

    /// Drop anything pending for a detached consumer.
    pub(crate) fn forget(&self, consumer: Uuid) {
        self.pending().dirty.remove(&consumer);
    }

    /// Number of windows flushed so far.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Consumers waiting in the open window.
    pub fn pending_consumers(&self) -> usize {
        self.pending().dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ConsumerState;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn consumer(renders: Arc<AtomicUsize>) -> Arc<Consumer> {
        let consumer = Consumer::new(
            ConsumerState::new().value("title", json!("t")),
            move |_| {
                renders.fetch_add(1, Ordering::SeqCst);
            },
        );
        consumer.force_subscribed();
        consumer
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_window_flushes_once() {
        let scheduler = FlushScheduler::new(Some(Duration::from_millis(16)));
        let renders = Arc::new(AtomicUsize::new(0));
        let c = consumer(renders.clone());
        for _ in 0..5 {
            c.set_value("title", json!("changed"));
            scheduler.mark(&c, "title");
        }
        assert_eq!(scheduler.pending_consumers(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(scheduler.flush_count(), 1);
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_consumers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_preempts_timer() {
        let scheduler = FlushScheduler::new(Some(Duration::from_millis(16)));
        let renders = Arc::new(AtomicUsize::new(0));
        let c = consumer(renders.clone());
        c.set_value("title", json!("a"));
        scheduler.mark(&c, "title");
        assert_eq!(scheduler.flush(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.flush_count(), 1);
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manual_mode_waits_for_flush() {
        let scheduler = FlushScheduler::new(None);
        let renders = Arc::new(AtomicUsize::new(0));
        let c = consumer(renders.clone());
        c.set_value("title", json!("a"));
        scheduler.mark(&c, "title");
        tokio::task::yield_now().await;
        assert_eq!(renders.load(Ordering::SeqCst), 0);

        assert_eq!(scheduler.flush(), 1);
        assert_eq!(scheduler.flush(), 0);
        assert_eq!(scheduler.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_forgotten_consumer_not_rendered() {
        let scheduler = FlushScheduler::new(None);
        let renders = Arc::new(AtomicUsize::new(0));
        let c = consumer(renders.clone());
        scheduler.mark(&c, "title");
        scheduler.forget(c.id());
        assert_eq!(scheduler.flush(), 0);
        assert_eq!(renders.load(Ordering::SeqCst), 0);
    }
}
