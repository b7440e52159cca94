//! Prometheus metrics for the cache synchronization core.
//!
//! Host applications can expose the registry on their own metrics endpoint.
//! Counters are recorded by the client facade; gauges are refreshed from a
//! periodic update loop via [`Metrics::update_queue_metrics`].

use crate::sync::queue::QueueStats;
use prometheus::{Counter, CounterVec, Gauge, Opts, Registry};
use std::sync::Arc;

/// All metrics for the sync core.
pub struct Metrics {
    pub registry: Registry,

    // Read-path metrics
    pub query_total: CounterVec,

    // Mutation metrics
    pub patches_applied_total: Counter,
    pub patches_committed_total: Counter,
    pub patches_rolled_back_total: Counter,

    // Cache state metrics
    pub cache_entries_total: Gauge,
    pub invalidations_total: Counter,
    pub push_events_total: Counter,

    // Sync queue metrics
    pub sync_queue_size: Gauge,
    pub sync_queue_due: Gauge,
    pub sync_queue_failed: Gauge,
}

impl Metrics {
    /// Create a new metrics registry with all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let query_total = CounterVec::new(
            Opts::new("feedsync_query_total", "Total read operations by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(query_total.clone()))?;

        let patches_applied_total = Counter::with_opts(Opts::new(
            "feedsync_patches_applied_total",
            "Optimistic patches applied",
        ))?;
        registry.register(Box::new(patches_applied_total.clone()))?;

        let patches_committed_total = Counter::with_opts(Opts::new(
            "feedsync_patches_committed_total",
            "Optimistic patches committed",
        ))?;
        registry.register(Box::new(patches_committed_total.clone()))?;

        let patches_rolled_back_total = Counter::with_opts(Opts::new(
            "feedsync_patches_rolled_back_total",
            "Optimistic patches rolled back",
        ))?;
        registry.register(Box::new(patches_rolled_back_total.clone()))?;

        let cache_entries_total = Gauge::with_opts(Opts::new(
            "feedsync_cache_entries_total",
            "Entries currently held in the cache store",
        ))?;
        registry.register(Box::new(cache_entries_total.clone()))?;

        let invalidations_total = Counter::with_opts(Opts::new(
            "feedsync_invalidations_total",
            "Tag invalidation requests processed",
        ))?;
        registry.register(Box::new(invalidations_total.clone()))?;

        let push_events_total = Counter::with_opts(Opts::new(
            "feedsync_push_events_total",
            "Real-time push events applied to the cache",
        ))?;
        registry.register(Box::new(push_events_total.clone()))?;

        let sync_queue_size = Gauge::with_opts(Opts::new(
            "feedsync_sync_queue_size",
            "Total tasks in the sync queue",
        ))?;
        registry.register(Box::new(sync_queue_size.clone()))?;

        let sync_queue_due = Gauge::with_opts(Opts::new(
            "feedsync_sync_queue_due",
            "Tasks due for attempt",
        ))?;
        registry.register(Box::new(sync_queue_due.clone()))?;

        let sync_queue_failed = Gauge::with_opts(Opts::new(
            "feedsync_sync_queue_failed",
            "Permanently failed tasks within the retention window",
        ))?;
        registry.register(Box::new(sync_queue_failed.clone()))?;

        Ok(Self {
            registry,
            query_total,
            patches_applied_total,
            patches_committed_total,
            patches_rolled_back_total,
            cache_entries_total,
            invalidations_total,
            push_events_total,
            sync_queue_size,
            sync_queue_due,
            sync_queue_failed,
        })
    }

    /// Refresh the entry-count gauge.
    pub fn update_cache_metrics(&self, entry_count: usize) {
        self.cache_entries_total.set(entry_count as f64);
    }

    /// Refresh queue gauges from a stats snapshot.
    pub fn update_queue_metrics(&self, stats: &QueueStats) {
        self.sync_queue_size.set(stats.total as f64);
        self.sync_queue_due.set(stats.due as f64);
        self.sync_queue_failed.set(stats.failed as f64);
    }
}

pub type SharedMetrics = Arc<Metrics>;

pub fn create_metrics() -> SharedMetrics {
    Arc::new(Metrics::new().expect("Failed to create metrics"))
}
