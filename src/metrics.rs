use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RebuildLabels {
    pub pipeline: Pipeline,
    pub outcome: RebuildOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Pipeline {
    Shard,
    Index,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RebuildOutcome {
    Committed,
    /// Another run already holds both locks; this trigger was a no-op.
    Skipped,
    /// Lock wait timed out or the run failed before commit.
    Aborted,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PipelineLabels {
    pub pipeline: Pipeline,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- rebuilds --
    pub rebuild_total: Family<RebuildLabels, Counter>,
    pub rebuild_duration_seconds: Family<PipelineLabels, Histogram>,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,

    // -- storage --
    pub snapshot_upload_bytes: Counter,

    // -- queue --
    pub queue_depth: Gauge,
    pub pending_sweep_requeues: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let rebuild_total = Family::<RebuildLabels, Counter>::default();
        registry.register(
            "shardgen_rebuild_total",
            "Rebuild runs by pipeline and outcome",
            rebuild_total.clone(),
        );

        let rebuild_duration_seconds =
            Family::<PipelineLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.1, 2.0, 12))
            });
        registry.register(
            "shardgen_rebuild_duration_seconds",
            "Rebuild latency (build + upload + commit) in seconds",
            rebuild_duration_seconds.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "shardgen_lock_acquisitions_total",
            "Distributed lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "shardgen_lock_waits_total",
            "Runs that queued behind an in-progress rebuild",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "shardgen_lock_timeouts_total",
            "Distributed lock timeout events",
            lock_timeouts.clone(),
        );

        let snapshot_upload_bytes = Counter::default();
        registry.register(
            "shardgen_snapshot_upload_bytes_total",
            "Total snapshot bytes uploaded to object storage",
            snapshot_upload_bytes.clone(),
        );

        let queue_depth: Gauge = Gauge::default();
        registry.register(
            "shardgen_queue_depth",
            "Rebuild jobs currently waiting in the queue",
            queue_depth.clone(),
        );

        let pending_sweep_requeues = Counter::default();
        registry.register(
            "shardgen_pending_sweep_requeues_total",
            "Shard rebuilds re-enqueued by the pending-marker sweep",
            pending_sweep_requeues.clone(),
        );

        Self {
            rebuild_total,
            rebuild_duration_seconds,
            lock_acquisitions,
            lock_waits,
            lock_timeouts,
            snapshot_upload_bytes,
            queue_depth,
            pending_sweep_requeues,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builds_and_counts() {
        let handle = MetricsRegistry::new();
        handle.metrics.lock_acquisitions.inc();
        handle
            .metrics
            .rebuild_total
            .get_or_create(&RebuildLabels {
                pipeline: Pipeline::Shard,
                outcome: RebuildOutcome::Committed,
            })
            .inc();
        assert_eq!(handle.metrics.lock_acquisitions.get(), 1);
    }
}
