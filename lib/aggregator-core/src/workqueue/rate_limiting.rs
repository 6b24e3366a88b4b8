//! Delayed and rate-limited re-adds on top of [`WorkQueue`]

use super::metrics::QueueMetrics;
use super::rate_limiter::RateLimiter;
use super::queue::WorkQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Work queue whose failed keys come back after a limiter-chosen delay
pub struct RateLimitingQueue<T> {
    queue: WorkQueue<T>,
    limiter: Arc<dyn RateLimiter<T>>,
    // Ready time of every key waiting for a delayed add
    waiting: Arc<Mutex<HashMap<T, Instant>>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: self.limiter.clone(),
            waiting: self.waiting.clone(),
        }
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self::from_queue(WorkQueue::new(name), limiter)
    }

    pub fn with_metrics(
        name: impl Into<String>,
        limiter: impl RateLimiter<T> + 'static,
        metrics: QueueMetrics,
    ) -> Self {
        Self::from_queue(WorkQueue::with_metrics(name, metrics), limiter)
    }

    fn from_queue(queue: WorkQueue<T>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            queue,
            limiter: Arc::new(limiter),
            waiting: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn shut_down(&self) {
        self.waiting.lock().clear();
        self.queue.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Add `item` once `delay` has elapsed.
    ///
    /// A key already waiting with an earlier ready time keeps that time.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut waiting = self.waiting.lock();
            if let Some(existing) = waiting.get(&item) {
                if *existing <= ready_at {
                    return;
                }
            }
            waiting.insert(item.clone(), ready_at);
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No async runtime for delayed add of {:?} on queue {}, adding now",
                    item,
                    self.queue.name()
                );
                self.waiting.lock().remove(&item);
                self.queue.add(item);
                return;
            }
        };

        let queue = self.queue.clone();
        let waiting = self.waiting.clone();
        runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(ready_at)).await;
            let mut pending = waiting.lock();
            // A sooner request replaced this one and already fired or is still pending
            if pending.get(&item) != Some(&ready_at) {
                return;
            }
            pending.remove(&item);
            drop(pending);
            queue.add(item);
        });
    }

    /// Add `item` after the delay its failure history calls for
    pub fn add_rate_limited(&self, item: T) {
        if let Some(metrics) = self.queue.metrics() {
            metrics.retries.inc();
        }
        let delay = self.limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clear the failure history of `item`
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workqueue::rate_limiter::ItemExponentialFailureRateLimiter;
    use tokio::time::timeout;

    fn test_queue() -> RateLimitingQueue<String> {
        RateLimitingQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_add_after_delays_delivery() {
        let queue = test_queue();
        let start = Instant::now();
        queue.add_after("a".to_string(), Duration::from_millis(50));
        assert!(queue.is_empty());

        let item = timeout(Duration::from_secs(1), queue.get()).await.unwrap();
        assert_eq!(item.as_deref(), Some("a"));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_add_after_zero_is_immediate() {
        let queue = test_queue();
        queue.add_after("a".to_string(), Duration::ZERO);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_sooner_add_after_wins() {
        let queue = test_queue();
        queue.add_after("a".to_string(), Duration::from_secs(30));
        queue.add_after("a".to_string(), Duration::from_millis(20));

        let item = timeout(Duration::from_secs(1), queue.get()).await.unwrap();
        assert_eq!(item.as_deref(), Some("a"));
        assert!(queue.waiting.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_backoff_grows_and_forget_resets() {
        let queue = test_queue();
        let key = "a".to_string();

        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_add_after_ignored_after_shutdown() {
        let queue = test_queue();
        queue.shut_down();
        queue.add_after("a".to_string(), Duration::from_millis(1));
        queue.add_rate_limited("b".to_string());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.get().await, None);
    }
}
