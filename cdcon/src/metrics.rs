//! Prometheus metrics for the connector supervisor.

use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector shared between the supervisor and the `/metrics`
/// endpoint. Cloning is cheap; all collectors are internally shared.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    running_watchers: Gauge,
    watcher_failures: CounterVec,
    watcher_restarts: CounterVec,
    watchers_started: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let running_watchers = Gauge::with_opts(Opts::new(
            "cdcon_running_watchers",
            "Number of currently running watcher tasks",
        ))
        .expect("Failed to create running_watchers gauge");

        let watcher_failures = CounterVec::new(
            Opts::new(
                "cdcon_watcher_failures_total",
                "Total number of watcher failures per collection",
            ),
            &["collection", "database", "error_kind"],
        )
        .expect("Failed to create watcher_failures counter");

        let watcher_restarts = CounterVec::new(
            Opts::new(
                "cdcon_watcher_restarts_total",
                "Total number of watcher restarts per collection",
            ),
            &["collection", "database", "reason"],
        )
        .expect("Failed to create watcher_restarts counter");

        let watchers_started = Counter::with_opts(Opts::new(
            "cdcon_watchers_started_total",
            "Total number of watcher tasks started since startup",
        ))
        .expect("Failed to create watchers_started counter");

        registry
            .register(Box::new(running_watchers.clone()))
            .expect("Failed to register running_watchers metric");
        registry
            .register(Box::new(watcher_failures.clone()))
            .expect("Failed to register watcher_failures metric");
        registry
            .register(Box::new(watcher_restarts.clone()))
            .expect("Failed to register watcher_restarts metric");
        registry
            .register(Box::new(watchers_started.clone()))
            .expect("Failed to register watchers_started metric");

        Self {
            registry,
            running_watchers,
            watcher_failures,
            watcher_restarts,
            watchers_started,
        }
    }

    pub fn set_running(&self, count: usize) {
        self.running_watchers.set(count as f64);
    }

    pub fn running(&self) -> usize {
        self.running_watchers.get() as usize
    }

    pub fn record_failure(&self, collection: &str, database: &str, error_kind: &str) {
        self.watcher_failures
            .with_label_values(&[collection, database, error_kind])
            .inc();
    }

    pub fn record_restart(&self, collection: &str, database: &str, reason: &str) {
        self.watcher_restarts
            .with_label_values(&[collection, database, reason])
            .inc();
    }

    pub fn record_start(&self) {
        self.watchers_started.inc();
    }

    /// Export all metrics in the Prometheus text format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}
