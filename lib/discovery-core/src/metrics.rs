//! Prometheus metrics for discovery watchers

use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics shared by every watcher it is handed to, labelled by base path
#[derive(Clone)]
pub struct DiscoveryMetrics {
    /// Change batches applied to the cache
    pub updates_total: IntCounterVec,
    /// Failed attempts to establish a watch
    pub watch_failures_total: IntCounterVec,
    /// Watch streams that ended and were re-established
    pub rewatches_total: IntCounterVec,
    /// Batches dropped for a subscriber that did not drain its channel
    pub dropped_batches_total: IntCounterVec,
    /// Endpoints in the cache
    pub endpoints: IntGaugeVec,
    /// Registered subscribers
    pub subscribers: IntGaugeVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl DiscoveryMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let updates_total = IntCounterVec::new(
            Opts::new("discovery_updates_total", "Change batches applied to the cache"),
            &["path"],
        )?;
        let watch_failures_total = IntCounterVec::new(
            Opts::new(
                "discovery_watch_failures_total",
                "Failed attempts to establish a watch",
            ),
            &["path"],
        )?;
        let rewatches_total = IntCounterVec::new(
            Opts::new("discovery_rewatches_total", "Watch streams re-established"),
            &["path"],
        )?;
        let dropped_batches_total = IntCounterVec::new(
            Opts::new(
                "discovery_dropped_batches_total",
                "Batches dropped for slow subscribers",
            ),
            &["path"],
        )?;
        let endpoints = IntGaugeVec::new(
            Opts::new("discovery_endpoints", "Endpoints in the cache"),
            &["path"],
        )?;
        let subscribers = IntGaugeVec::new(
            Opts::new("discovery_subscribers", "Registered subscribers"),
            &["path"],
        )?;

        registry.register(Box::new(updates_total.clone()))?;
        registry.register(Box::new(watch_failures_total.clone()))?;
        registry.register(Box::new(rewatches_total.clone()))?;
        registry.register(Box::new(dropped_batches_total.clone()))?;
        registry.register(Box::new(endpoints.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;

        Ok(Self {
            updates_total,
            watch_failures_total,
            rewatches_total,
            dropped_batches_total,
            endpoints,
            subscribers,
            registry,
        })
    }

    pub fn record_update(&self, path: &str, endpoints: usize) {
        self.updates_total.with_label_values(&[path]).inc();
        self.endpoints
            .with_label_values(&[path])
            .set(endpoints as i64);
    }

    pub fn record_watch_failure(&self, path: &str) {
        self.watch_failures_total.with_label_values(&[path]).inc();
    }

    pub fn record_rewatch(&self, path: &str) {
        self.rewatches_total.with_label_values(&[path]).inc();
    }

    pub fn record_dropped(&self, path: &str) {
        self.dropped_batches_total.with_label_values(&[path]).inc();
    }

    pub fn set_subscribers(&self, path: &str, count: usize) {
        self.subscribers.with_label_values(&[path]).set(count as i64);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_gather() {
        let metrics = DiscoveryMetrics::new().unwrap();
        metrics.record_update("svc", 3);
        metrics.record_update("svc", 2);
        metrics.record_dropped("svc");
        metrics.set_subscribers("svc", 4);

        assert_eq!(metrics.updates_total.with_label_values(&["svc"]).get(), 2);
        assert_eq!(metrics.endpoints.with_label_values(&["svc"]).get(), 2);

        let text = metrics.gather().unwrap();
        assert!(text.contains("discovery_updates_total{path=\"svc\"} 2"));
        assert!(text.contains("discovery_dropped_batches_total{path=\"svc\"} 1"));
        assert!(text.contains("discovery_subscribers{path=\"svc\"} 4"));
    }
}
