//! Rate-limited work queue used to drive reconciliation

mod metrics;
mod queue;
mod rate_limiter;
mod rate_limiting;

pub use metrics::{ControllerMetrics, QueueMetrics};
pub use queue::WorkQueue;
pub use rate_limiter::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter,
    ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
};
pub use rate_limiting::RateLimitingQueue;
