//! Background worker loops.
//!
//! Three long-lived tasks run alongside the HTTP server:
//!   - the job loop, which drains the rebuild queue and dispatches to the
//!     shard and index pipelines;
//!   - the pending sweep, which re-enqueues shards whose pending-rebuild
//!     marker survived a crash;
//!   - the heartbeat, owned by `coordination::node`.
//!
//! Failed runs with a retriable error go back on the queue. Snapshot keys
//! are generation-addressed, so running the same job twice is harmless.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::coordination::queue::{self, RebuildJob};
use crate::error::Result;
use crate::pipeline;
use crate::AppState;

/// Poll the rebuild queue and execute jobs until shutdown.
pub async fn run_job_loop(state: AppState) {
    let poll_interval = Duration::from_millis(state.config.worker.queue_poll_ms);
    info!(poll_ms = state.config.worker.queue_poll_ms, "rebuild worker started");

    loop {
        match queue::dequeue(&state.keydb).await {
            Ok(Some(job)) => {
                if let Err(e) = execute_job(&state, job).await {
                    if e.is_retriable() {
                        warn!(?job, error = %e, "rebuild failed, re-enqueueing");
                        if let Err(e) = queue::enqueue(&state.keydb, job).await {
                            error!(?job, error = %e, "re-enqueue failed, job dropped");
                        }
                    } else {
                        error!(?job, error = %e, "rebuild failed");
                    }
                }
            }
            Ok(None) => {
                update_queue_depth(&state).await;
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => {
                warn!(error = %e, "queue poll failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

async fn execute_job(state: &AppState, job: RebuildJob) -> Result<()> {
    debug!(?job, "executing rebuild job");
    match job {
        RebuildJob::ShardRebuild { shard_id } => {
            pipeline::shard::run_shard_rebuild(state, shard_id).await
        }
        RebuildJob::IndexRebuild => pipeline::index::run_index_rebuild(state).await,
    }
}

async fn update_queue_depth(state: &AppState) {
    match queue::depth(&state.keydb).await {
        Ok(depth) => {
            state.metrics.metrics.queue_depth.set(depth as i64);
        }
        Err(e) => debug!(error = %e, "queue depth probe failed"),
    }
}

/// Periodically re-enqueue shards whose pending marker is still set. The
/// marker is cleared on successful commit, so anything found here belongs to
/// a run that queued intent and then died before delivering.
pub async fn run_pending_sweep(state: AppState) {
    let interval = Duration::from_secs(state.config.worker.pending_sweep_secs);
    info!(secs = state.config.worker.pending_sweep_secs, "pending sweep started");

    loop {
        tokio::time::sleep(interval).await;

        let shard_ids = match queue::pending_shards(&state.keydb).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "pending sweep read failed");
                continue;
            }
        };

        for shard_id in shard_ids {
            // Skip shards with a live rebuild; their own run clears or
            // re-queues the marker.
            match crate::coordination::lock::shard_rebuild_active(&state.keydb, shard_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(shard_id, error = %e, "pending sweep lock probe failed");
                    continue;
                }
            }

            info!(shard_id, "re-enqueueing stranded pending rebuild");
            if let Err(e) =
                queue::enqueue(&state.keydb, RebuildJob::ShardRebuild { shard_id }).await
            {
                warn!(shard_id, error = %e, "pending sweep re-enqueue failed");
                continue;
            }
            state.metrics.metrics.pending_sweep_requeues.inc();
        }
    }
}
