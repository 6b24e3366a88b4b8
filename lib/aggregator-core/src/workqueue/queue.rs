//! Deduplicating FIFO work queue

use super::metrics::QueueMetrics;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

/// WorkQueue hands out each key to at most one consumer at a time.
///
/// A key added while queued is collapsed into the pending entry. A key added
/// while being processed is marked dirty and handed out again once `done`
/// is called for it.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    metrics: Option<QueueMetrics>,
}

struct State<T> {
    queue: VecDeque<T>,
    // Keys that need processing, queued or not
    dirty: HashSet<T>,
    // Keys currently handed out
    processing: HashSet<T>,
    added_at: HashMap<T, Instant>,
    started_at: HashMap<T, Instant>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue without metrics
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Create a queue reporting to the given metrics
    pub fn with_metrics(name: impl Into<String>, metrics: QueueMetrics) -> Self {
        Self::build(name.into(), Some(metrics))
    }

    fn build(name: String, metrics: Option<QueueMetrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    added_at: HashMap::new(),
                    started_at: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn metrics(&self) -> Option<&QueueMetrics> {
        self.inner.metrics.as_ref()
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }

        if let Some(metrics) = &self.inner.metrics {
            metrics.adds.inc();
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }

        self.push(&mut state, item);
    }

    fn push(&self, state: &mut State<T>, item: T) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.depth.inc();
        }
        state.added_at.entry(item.clone()).or_insert_with(Instant::now);
        state.queue.push_back(item);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    let now = Instant::now();
                    if let Some(metrics) = &self.inner.metrics {
                        metrics.depth.dec();
                        if let Some(added) = state.added_at.remove(&item) {
                            metrics
                                .queue_duration
                                .observe(now.duration_since(added).as_secs_f64());
                        }
                    } else {
                        state.added_at.remove(&item);
                    }
                    state.started_at.insert(item.clone(), now);
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);

                    // Another waiter may be able to take the next key
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark processing of `item` as finished
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        if let Some(started) = state.started_at.remove(item) {
            if let Some(metrics) = &self.inner.metrics {
                metrics.work_duration.observe(started.elapsed().as_secs_f64());
            }
        }
        state.processing.remove(item);
        if state.dirty.contains(item) {
            self.push(&mut state, item.clone());
        }
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every waiting consumer
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock();
        state.shutting_down = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
