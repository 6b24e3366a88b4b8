//! Prometheus metrics for work queues

use crate::Result;
use prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics shared by every queue of a controller process
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Current number of keys waiting to be processed
    pub workqueue_depth: IntGaugeVec,
    /// Total keys added
    pub workqueue_adds_total: IntCounterVec,
    /// Total rate-limited re-adds
    pub workqueue_retries_total: IntCounterVec,
    /// Seconds a key waits in the queue before being handed out
    pub workqueue_queue_duration_seconds: HistogramVec,
    /// Seconds spent processing a key
    pub workqueue_work_duration_seconds: HistogramVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl ControllerMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let workqueue_depth = IntGaugeVec::new(
            Opts::new("workqueue_depth", "Current depth of workqueue"),
            &["name"],
        )?;

        let workqueue_adds_total = IntCounterVec::new(
            Opts::new("workqueue_adds_total", "Total number of adds handled by workqueue"),
            &["name"],
        )?;

        let workqueue_retries_total = IntCounterVec::new(
            Opts::new("workqueue_retries_total", "Total number of retries handled by workqueue"),
            &["name"],
        )?;

        let workqueue_queue_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "workqueue_queue_duration_seconds",
                "How long in seconds an item stays in workqueue before being requested",
            )
            .buckets(exponential_buckets(1e-8, 10.0, 10)?),
            &["name"],
        )?;

        let workqueue_work_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "workqueue_work_duration_seconds",
                "How long in seconds processing an item from workqueue takes",
            )
            .buckets(exponential_buckets(1e-8, 10.0, 10)?),
            &["name"],
        )?;

        registry.register(Box::new(workqueue_depth.clone()))?;
        registry.register(Box::new(workqueue_adds_total.clone()))?;
        registry.register(Box::new(workqueue_retries_total.clone()))?;
        registry.register(Box::new(workqueue_queue_duration_seconds.clone()))?;
        registry.register(Box::new(workqueue_work_duration_seconds.clone()))?;

        Ok(Self {
            workqueue_depth,
            workqueue_adds_total,
            workqueue_retries_total,
            workqueue_queue_duration_seconds,
            workqueue_work_duration_seconds,
            registry,
        })
    }

    /// Metric handles for the queue called `name`
    pub fn for_queue(&self, name: &str) -> QueueMetrics {
        QueueMetrics {
            depth: self.workqueue_depth.with_label_values(&[name]),
            adds: self.workqueue_adds_total.with_label_values(&[name]),
            retries: self.workqueue_retries_total.with_label_values(&[name]),
            queue_duration: self.workqueue_queue_duration_seconds.with_label_values(&[name]),
            work_duration: self.workqueue_work_duration_seconds.with_label_values(&[name]),
        }
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Metric handles bound to one queue name
#[derive(Clone)]
pub struct QueueMetrics {
    pub depth: prometheus::IntGauge,
    pub adds: prometheus::IntCounter,
    pub retries: prometheus::IntCounter,
    pub queue_duration: prometheus::Histogram,
    pub work_duration: prometheus::Histogram,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_queue_series() {
        let metrics = ControllerMetrics::new().unwrap();
        let queue = metrics.for_queue("test");
        queue.adds.inc();
        queue.depth.set(3);

        let text = metrics.gather().unwrap();
        assert!(text.contains("workqueue_adds_total{name=\"test\"} 1"));
        assert!(text.contains("workqueue_depth{name=\"test\"} 3"));
    }

    #[test]
    fn test_queues_are_labelled_separately() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.for_queue("a").retries.inc();
        metrics.for_queue("a").retries.inc();
        metrics.for_queue("b").retries.inc();

        assert_eq!(metrics.workqueue_retries_total.with_label_values(&["a"]).get(), 2);
        assert_eq!(metrics.workqueue_retries_total.with_label_values(&["b"]).get(), 1);
    }
}
