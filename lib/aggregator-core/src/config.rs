//! Controller configuration loaded from the environment

use crate::{CoreError, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Slowest overall retry rate accepted
const MIN_QUEUE_QPS: f64 = 0.001;

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(CoreError::InvalidConfiguration(format!(
                "unknown log format {:?}",
                other
            ))),
        }
    }
}

/// Settings for the registration controller and its work queue
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Initial per-key retry delay
    pub queue_base_delay: Duration,
    /// Upper bound on per-key retry delay
    pub queue_max_delay: Duration,
    /// Overall retry rate across all keys
    pub queue_qps: f64,
    /// Retry burst allowed above `queue_qps`
    pub queue_burst: u32,
    /// How often cache sync status is polled at startup
    pub cache_sync_poll_interval: Duration,
    /// Listen address for health and metrics
    pub metrics_addr: SocketAddr,
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_base_delay: Duration::from_millis(5),
            queue_max_delay: Duration::from_secs(1000),
            queue_qps: 10.0,
            queue_burst: 100,
            cache_sync_poll_interval: Duration::from_millis(100),
            metrics_addr: ([0, 0, 0, 0], 8080).into(),
            log_format: LogFormat::Text,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `AGGREGATOR_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration using `lookup` to resolve variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "AGGREGATOR_QUEUE_BASE_DELAY_MS")? {
            config.queue_base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "AGGREGATOR_QUEUE_MAX_DELAY_SECS")? {
            config.queue_max_delay = Duration::from_secs(secs);
        }
        if let Some(qps) = parse_var(&lookup, "AGGREGATOR_QUEUE_QPS")? {
            config.queue_qps = qps;
        }
        if let Some(burst) = parse_var(&lookup, "AGGREGATOR_QUEUE_BURST")? {
            config.queue_burst = burst;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "AGGREGATOR_CACHE_SYNC_POLL_MS")? {
            config.cache_sync_poll_interval = Duration::from_millis(ms);
        }
        if let Some(addr) = parse_var(&lookup, "AGGREGATOR_METRICS_ADDR")? {
            config.metrics_addr = addr;
        }
        if let Some(format) = lookup("AGGREGATOR_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.queue_qps.is_finite() && self.queue_qps >= MIN_QUEUE_QPS) {
            return Err(CoreError::InvalidConfiguration(format!(
                "queue qps must be at least {}, got {}",
                MIN_QUEUE_QPS, self.queue_qps
            )));
        }
        if self.queue_burst == 0 {
            return Err(CoreError::InvalidConfiguration(
                "queue burst must be at least 1".to_string(),
            ));
        }
        if self.queue_base_delay > self.queue_max_delay {
            return Err(CoreError::InvalidConfiguration(format!(
                "queue base delay {:?} exceeds max delay {:?}",
                self.queue_base_delay, self.queue_max_delay
            )));
        }
        if self.cache_sync_poll_interval.is_zero() {
            return Err(CoreError::InvalidConfiguration(
                "cache sync poll interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
            CoreError::InvalidConfiguration(format!("{}={:?}: {}", name, raw, e))
        }),
    }
}
