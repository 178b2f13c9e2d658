//! Whole-registry index rebuild.
//!
//! Simpler sibling of the shard pipeline: one global lock, no pending-intent
//! companion, no generation counter. A trigger that finds the lock taken is
//! dropped outright; the per-shard pipelines keep the data eventually
//! consistent, so a missed index rebuild costs only freshness.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::coordination::lock::{index_lock_key, DistributedLock};
use crate::db::shards;
use crate::error::{RegistryError, Result};
use crate::metrics::{Pipeline, PipelineLabels, RebuildLabels, RebuildOutcome};
use crate::snapshot::Snapshot;
use crate::storage::s3::index_snapshot_key;
use crate::AppState;

/// Execute one whole-index rebuild run.
#[instrument(skip(state))]
pub async fn run_index_rebuild(state: &AppState) -> Result<()> {
    let mut lock = DistributedLock::new(
        state.keydb.clone(),
        index_lock_key(),
        Duration::from_secs(state.config.locks.index_expire),
    );

    if !lock.try_acquire().await? {
        info!("index rebuild already running, skipping");
        record_outcome(state, RebuildOutcome::Skipped);
        return Ok(());
    }
    state.metrics.metrics.lock_acquisitions.inc();

    let started = Instant::now();
    let result = build_and_upload(state).await;

    if let Err(e) = lock.release().await {
        warn!(error = %e, "index lock release failed");
    }

    match result {
        Ok(()) => {
            state
                .metrics
                .metrics
                .rebuild_duration_seconds
                .get_or_create(&PipelineLabels {
                    pipeline: Pipeline::Index,
                })
                .observe(started.elapsed().as_secs_f64());
            record_outcome(state, RebuildOutcome::Committed);
            Ok(())
        }
        Err(e) => {
            record_outcome(state, RebuildOutcome::Aborted);
            Err(e)
        }
    }
}

async fn build_and_upload(state: &AppState) -> Result<()> {
    let grouped = shards::all_package_versions(&state.db).await?;

    let snapshot = Snapshot::from_version_rows(grouped);
    let included = snapshot.included_versions();
    info!(
        packages = snapshot.package_count(),
        versions = included.len(),
        "building whole-registry index"
    );

    let bytes = snapshot.encode().map_err(RegistryError::Upload)?;
    let byte_count = bytes.len() as u64;

    let key = index_snapshot_key(Utc::now());
    let location = state
        .storage
        .put_snapshot(&key, bytes)
        .await
        .map_err(RegistryError::Upload)?;
    state.metrics.metrics.snapshot_upload_bytes.inc_by(byte_count);

    shards::mark_versions_published(&state.db, &included)
        .await
        .map_err(|e| match e {
            RegistryError::Commit(_) => e,
            other => RegistryError::Commit(anyhow::Error::new(other)),
        })?;

    info!(%location, "index snapshot committed");
    Ok(())
}

fn record_outcome(state: &AppState, outcome: RebuildOutcome) {
    state
        .metrics
        .metrics
        .rebuild_total
        .get_or_create(&RebuildLabels {
            pipeline: Pipeline::Index,
            outcome,
        })
        .inc();
}
