//! Retry delay policies for rate-limited queues

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// RateLimiter decides how long a key waits before being retried
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` is retried; records one more failure
    fn when(&self, item: &T) -> Duration;
    /// Stop tracking `item`, resetting its backoff
    fn forget(&self, item: &T);
    /// Number of failures recorded for `item`
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: Eq + Hash> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

const DEFAULT_BUCKET_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Overall token bucket shared by every key
pub struct BucketRateLimiter {
    bucket: Mutex<Bucket>,
    qps: f64,
    burst: f64,
    max_delay: Duration,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// `qps` tokens are added per second, up to `burst` tokens
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
            qps,
            burst,
            max_delay: DEFAULT_BUCKET_MAX_DELAY,
        }
    }

    /// Cap on the delay handed out once the bucket runs dry
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Reserve a token, returning how long until it may be used
    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps)
                .unwrap_or(self.max_delay)
                .min(self.max_delay)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Applies the worst delay of all member limiters
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff combined with an overall bucket
pub fn controller_rate_limiter<T>(
    base_delay: Duration,
    max_delay: Duration,
    qps: f64,
    burst: u32,
) -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(base_delay, max_delay)),
        Box::new(BucketRateLimiter::new(qps, burst).with_max_delay(max_delay)),
    ])
}

/// 5ms..1000s per-key backoff with a 10 qps / 100 burst overall limit
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    controller_rate_limiter(Duration::from_millis(5), Duration::from_secs(1000), 10.0, 100)
}
