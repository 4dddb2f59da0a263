//! Metrics shared by every handle of a [crate::Cache].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Counters describing cache activity. Cloning shares the underlying values.
#[derive(Clone, Default)]
pub struct Metrics {
    /// Reads answered entirely from resident lines.
    pub hits: Counter,
    /// Reads that returned no data.
    pub misses: Counter,
    /// Reads issued to storage.
    pub reads_issued: Counter,
    /// Reads skipped because an identical read was already in flight.
    pub reads_deduplicated: Counter,
    /// Reads not issued because the in-flight limit was reached.
    pub reads_deferred: Counter,
    /// Reads that completed with an error.
    pub reads_failed: Counter,
    /// Lines copied into a slot after a read completed.
    pub lines_cached: Counter,
    /// Completed lines dropped because they were already resident.
    pub lines_discarded: Counter,
    /// Resident lines evicted to make room for others.
    pub evictions: Counter,
    /// Slot searches that found every candidate locked.
    pub exhausted: Counter,
    /// Slots currently owned by a line.
    pub slots_owned: Gauge,
}

impl Metrics {
    /// Create metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "hits",
            "Number of reads answered entirely from resident lines",
            metrics.hits.clone(),
        );
        registry.register(
            "misses",
            "Number of reads that returned no data",
            metrics.misses.clone(),
        );
        registry.register(
            "reads_issued",
            "Number of reads issued to storage",
            metrics.reads_issued.clone(),
        );
        registry.register(
            "reads_deduplicated",
            "Number of reads skipped because an identical read was in flight",
            metrics.reads_deduplicated.clone(),
        );
        registry.register(
            "reads_deferred",
            "Number of reads not issued because the in-flight limit was reached",
            metrics.reads_deferred.clone(),
        );
        registry.register(
            "reads_failed",
            "Number of reads that completed with an error",
            metrics.reads_failed.clone(),
        );
        registry.register(
            "lines_cached",
            "Number of lines copied into a slot",
            metrics.lines_cached.clone(),
        );
        registry.register(
            "lines_discarded",
            "Number of completed lines dropped because they were already resident",
            metrics.lines_discarded.clone(),
        );
        registry.register(
            "evictions",
            "Number of resident lines evicted",
            metrics.evictions.clone(),
        );
        registry.register(
            "exhausted",
            "Number of slot searches that found every candidate locked",
            metrics.exhausted.clone(),
        );
        registry.register(
            "slots_owned",
            "Number of slots currently owned by a line",
            metrics.slots_owned.clone(),
        );
        metrics
    }
}
