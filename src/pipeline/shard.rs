//! Per-shard snapshot rebuild.
//!
//! One run moves a shard through
//! `LOCK_ACQUIRING → BUILDING → UPLOADING → COMMITTING → COOLDOWN`, or
//! aborts early when another run already owns both the primary and the
//! pending-intent lock. The pending-intent lock is a short-lived marker
//! meaning "a rebuild is queued behind the current one"; a third concurrent
//! trigger that finds both locks taken is a no-op, which bounds queue
//! buildup under bursty triggers.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::coordination::lock::{shard_lock_key, shard_pending_lock_key, DistributedLock};
use crate::coordination::queue;
use crate::db::shards;
use crate::error::{RegistryError, Result};
use crate::metrics::{Pipeline, PipelineLabels, RebuildLabels, RebuildOutcome};
use crate::snapshot::Snapshot;
use crate::storage::s3::shard_snapshot_key;
use crate::AppState;

/// Execute one shard rebuild run.
///
/// Lock-wait timeouts are swallowed here (logged, run aborted): retrying is
/// the dispatcher's call, and the durable pending marker guarantees the
/// shard is re-triggered eventually. Upload and commit failures propagate
/// so the worker loop can re-enqueue the job.
#[instrument(skip(state))]
pub async fn run_shard_rebuild(state: &AppState, shard_id: u32) -> Result<()> {
    let locks = &state.config.locks;
    let retry_interval = Duration::from_millis(locks.retry_interval_ms);

    let mut primary = DistributedLock::new(
        state.keydb.clone(),
        shard_lock_key(shard_id),
        Duration::from_secs(locks.shard_expire),
    );
    let mut pending = DistributedLock::new(
        state.keydb.clone(),
        shard_pending_lock_key(shard_id),
        Duration::from_secs(locks.pending_expire),
    );

    // LOCK_ACQUIRING
    if !primary.try_acquire().await? {
        if !pending.try_acquire().await? {
            info!(shard_id, "rebuild already queued behind the current run, skipping");
            record_outcome(state, RebuildOutcome::Skipped);
            return Ok(());
        }

        // Persist the intent before waiting: if this worker dies here, the
        // periodic sweep re-enqueues the shard instead of losing the run.
        queue::mark_pending(&state.keydb, shard_id).await?;
        state.metrics.metrics.lock_waits.inc();
        info!(shard_id, "waiting for in-progress rebuild to finish");

        let waited = primary
            .acquire(Duration::from_secs(locks.acquire_timeout), retry_interval)
            .await;
        match classify_wait(waited) {
            WaitOutcome::Acquired => {}
            WaitOutcome::GaveUp { name, waited } => {
                state.metrics.metrics.lock_timeouts.inc();
                warn!(shard_id, lock = %name, ?waited, "gave up waiting for shard lock");
                // The pending marker stays set; the sweep will re-trigger.
                release_quietly(&mut pending).await;
                record_outcome(state, RebuildOutcome::Aborted);
                return Ok(());
            }
            WaitOutcome::Failed(e) => {
                release_quietly(&mut pending).await;
                return Err(e);
            }
        }
    }
    state.metrics.metrics.lock_acquisitions.inc();

    // We own the primary lock now; the pending slot opens up for the next
    // queued trigger.
    if pending.is_held() {
        release_quietly(&mut pending).await;
    }

    // Read the marker before the build: intent recorded mid-flight is for a
    // newer state of the shard than the snapshot this run is about to read,
    // and must survive this run's commit for its owner (or the sweep).
    let marker_observed = match queue::is_pending(&state.keydb, shard_id).await {
        Ok(observed) => observed,
        Err(e) => {
            warn!(shard_id, error = %e, "pending marker probe failed");
            false
        }
    };

    let started = Instant::now();
    match build_upload_commit(state, shard_id).await {
        Ok(()) => {
            if settle_marker(marker_observed) == MarkerSettlement::Clear {
                if let Err(e) = queue::clear_pending(&state.keydb, shard_id).await {
                    // Worst case the sweep re-triggers one redundant run.
                    warn!(shard_id, error = %e, "pending marker clear failed");
                }
            }

            state
                .metrics
                .metrics
                .rebuild_duration_seconds
                .get_or_create(&PipelineLabels {
                    pipeline: Pipeline::Shard,
                })
                .observe(started.elapsed().as_secs_f64());
            record_outcome(state, RebuildOutcome::Committed);

            // COOLDOWN: keep exclusivity for the converge window by
            // re-arming the lock's expiry instead of sleeping on a worker
            // slot. The backend timer releases it.
            if let Err(e) = primary
                .hold_for(Duration::from_secs(locks.cooldown))
                .await
            {
                // Expiry raced the commit; exclusivity was already lost and
                // there is nothing left to schedule.
                warn!(shard_id, error = %e, "could not schedule cooldown release");
            }
            Ok(())
        }
        Err(e) => {
            release_quietly(&mut primary).await;
            record_outcome(state, RebuildOutcome::Aborted);
            Err(e)
        }
    }
}

/// BUILDING → UPLOADING → COMMITTING, under the primary lock.
async fn build_upload_commit(state: &AppState, shard_id: u32) -> Result<()> {
    // BUILDING: read the generation first; the snapshot key and the commit
    // guard both derive from it.
    let shard = shards::get_shard(&state.db, shard_id).await?;
    let grouped = shards::shard_package_versions(&state.db, shard_id).await?;

    let snapshot = Snapshot::from_version_rows(grouped);
    let included = snapshot.included_versions();
    info!(
        shard_id,
        generation = shard.generation,
        packages = snapshot.package_count(),
        versions = included.len(),
        "building shard snapshot"
    );

    let bytes = snapshot.encode().map_err(RegistryError::Upload)?;
    let byte_count = bytes.len() as u64;

    // UPLOADING: the key embeds the generation read above, so a crash after
    // this point never clobbers an already-published snapshot.
    let key = shard_snapshot_key(shard_id, shard.generation);
    let location = state
        .storage
        .put_snapshot(&key, bytes)
        .await
        .map_err(RegistryError::Upload)?;
    state.metrics.metrics.snapshot_upload_bytes.inc_by(byte_count);

    // COMMITTING: one transaction advances the generation, repoints the
    // location, and publishes exactly the versions the snapshot contains.
    shards::commit_shard_generation(&state.db, shard_id, shard.generation, &location, &included)
        .await
        .map_err(|e| match e {
            RegistryError::Commit(_) => e,
            other => RegistryError::Commit(anyhow::Error::new(other)),
        })?;

    info!(
        shard_id,
        generation = shard.generation + 1,
        %location,
        "shard snapshot committed"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Run-control decisions
// ---------------------------------------------------------------------------

enum WaitOutcome {
    Acquired,
    /// The wait timed out. Absorbed: the run aborts cleanly and the durable
    /// marker keeps the shard scheduled.
    GaveUp { name: String, waited: Duration },
    Failed(RegistryError),
}

/// Sort a blocking-wait result into the pipeline's three continuations.
fn classify_wait(result: Result<()>) -> WaitOutcome {
    match result {
        Ok(()) => WaitOutcome::Acquired,
        Err(RegistryError::LockTimeout { name, waited }) => WaitOutcome::GaveUp { name, waited },
        Err(e) => WaitOutcome::Failed(e),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum MarkerSettlement {
    Clear,
    /// The marker belongs to a run whose intent this commit does not cover;
    /// its owner clears it, or the sweep re-triggers the shard.
    LeaveForOwner,
}

/// Whether this run's commit settles the shard's pending marker. Only a
/// marker that already existed when the build read its rows is covered by
/// the committed snapshot.
fn settle_marker(marker_observed_before_build: bool) -> MarkerSettlement {
    if marker_observed_before_build {
        MarkerSettlement::Clear
    } else {
        MarkerSettlement::LeaveForOwner
    }
}

async fn release_quietly(lock: &mut DistributedLock) {
    if let Err(e) = lock.release().await {
        warn!(lock = %lock.name(), error = %e, "lock release failed");
    }
}

fn record_outcome(state: &AppState, outcome: RebuildOutcome) {
    state
        .metrics
        .metrics
        .rebuild_total
        .get_or_create(&RebuildLabels {
            pipeline: Pipeline::Shard,
            outcome,
        })
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_is_absorbed_not_propagated() {
        let timeout = RegistryError::LockTimeout {
            name: shard_lock_key(4),
            waited: Duration::from_secs(60),
        };
        match classify_wait(Err(timeout)) {
            WaitOutcome::GaveUp { name, waited } => {
                assert_eq!(name, "shardgen:shard:4:lock");
                assert_eq!(waited, Duration::from_secs(60));
            }
            _ => panic!("timeout must abort the run without an error"),
        }
    }

    #[test]
    fn test_backend_failures_during_wait_propagate() {
        let backend = RegistryError::Coordination(anyhow::anyhow!("connection reset"));
        assert!(matches!(
            classify_wait(Err(backend)),
            WaitOutcome::Failed(RegistryError::Coordination(_))
        ));
        assert!(matches!(classify_wait(Ok(())), WaitOutcome::Acquired));
    }

    #[test]
    fn test_commit_only_settles_markers_it_observed_before_building() {
        // A run that was already building when a queued trigger recorded
        // its intent commits a snapshot that predates that intent. Clearing
        // the marker there would strand the shard if the queued run then
        // died before rebuilding.
        assert_eq!(settle_marker(false), MarkerSettlement::LeaveForOwner);
        assert_eq!(settle_marker(true), MarkerSettlement::Clear);
    }
}
