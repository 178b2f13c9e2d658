//! Rebuild job queue and durable pending-rebuild markers.
//!
//! Jobs travel through a KeyDB list (`LPUSH` by producers, `RPOP` by the
//! worker loop), serialized as JSON. Delivery is at-least-once: the worker
//! pushes a job back when its run fails with a retriable error, and the
//! generation-addressed snapshot keys make duplicate runs harmless.
//!
//! Pending markers are the durable form of the pending-intent lock: a run
//! that queues itself behind an in-progress rebuild records the shard id in
//! a set, and a periodic sweep re-enqueues marked shards. A worker crash
//! between "intent taken" and "rebuild executed" therefore no longer strands
//! the shard until some unrelated trigger fires.

use anyhow::Context;
use fred::clients::Pool;
use fred::interfaces::{ListInterface, SetsInterface};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegistryError, Result};

const QUEUE_KEY: &str = "shardgen:rebuild:queue";
const PENDING_SET_KEY: &str = "shardgen:rebuild:pending";

/// A unit of rebuild work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RebuildJob {
    /// Rebuild one shard's snapshot and advance its generation.
    ShardRebuild { shard_id: u32 },
    /// Rebuild the whole-registry index snapshot.
    IndexRebuild,
}

/// Push a job onto the rebuild queue.
pub async fn enqueue(pool: &Pool, job: RebuildJob) -> Result<()> {
    let payload = serde_json::to_string(&job)
        .context("serialize rebuild job")
        .map_err(RegistryError::Coordination)?;
    let _: i64 = pool
        .lpush(QUEUE_KEY, payload)
        .await
        .map_err(queue_error)?;
    debug!(?job, "rebuild job enqueued");
    Ok(())
}

/// Pop the oldest queued job, if any. The worker loop polls this; unknown
/// payloads are dropped with a warning rather than wedging the queue.
pub async fn dequeue(pool: &Pool) -> Result<Option<RebuildJob>> {
    let payload: Option<String> = pool.rpop(QUEUE_KEY, None).await.map_err(queue_error)?;
    let Some(payload) = payload else {
        return Ok(None);
    };

    match serde_json::from_str(&payload) {
        Ok(job) => Ok(Some(job)),
        Err(e) => {
            tracing::warn!(error = %e, payload, "dropping malformed rebuild job");
            Ok(None)
        }
    }
}

/// Current queue depth, for the metrics gauge.
pub async fn depth(pool: &Pool) -> Result<u64> {
    let len: i64 = pool.llen(QUEUE_KEY).await.map_err(queue_error)?;
    Ok(len.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Durable pending markers
// ---------------------------------------------------------------------------

/// Record that a follow-up rebuild is owed to `shard_id`.
pub async fn mark_pending(pool: &Pool, shard_id: u32) -> Result<()> {
    let _: i64 = pool
        .sadd(PENDING_SET_KEY, shard_id.to_string())
        .await
        .map_err(queue_error)?;
    debug!(shard_id, "pending rebuild marker set");
    Ok(())
}

/// Whether a pending marker is currently set for `shard_id`. The shard
/// pipeline reads this before its build so a commit only settles intent that
/// the committed snapshot actually covers.
pub async fn is_pending(pool: &Pool, shard_id: u32) -> Result<bool> {
    let member: bool = pool
        .sismember(PENDING_SET_KEY, shard_id.to_string())
        .await
        .map_err(queue_error)?;
    Ok(member)
}

/// Clear the marker after a successful commit.
pub async fn clear_pending(pool: &Pool, shard_id: u32) -> Result<()> {
    let _: i64 = pool
        .srem(PENDING_SET_KEY, shard_id.to_string())
        .await
        .map_err(queue_error)?;
    Ok(())
}

/// Shards that still owe a rebuild. Consumed by the periodic sweep.
pub async fn pending_shards(pool: &Pool) -> Result<Vec<u32>> {
    let members: Vec<String> = pool
        .smembers(PENDING_SET_KEY)
        .await
        .map_err(queue_error)?;
    Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
}

fn queue_error(err: impl Into<anyhow::Error>) -> RegistryError {
    RegistryError::Coordination(err.into().context("rebuild queue operation failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_wire_format() {
        let job = RebuildJob::ShardRebuild { shard_id: 7 };
        let json = serde_json::to_string(&job).unwrap();
        assert_eq!(json, r#"{"kind":"shard_rebuild","shard_id":7}"#);
        assert_eq!(serde_json::from_str::<RebuildJob>(&json).unwrap(), job);

        let index = serde_json::to_string(&RebuildJob::IndexRebuild).unwrap();
        assert_eq!(index, r#"{"kind":"index_rebuild"}"#);
    }

    #[test]
    fn test_malformed_job_does_not_round_trip() {
        assert!(serde_json::from_str::<RebuildJob>(r#"{"kind":"defrag"}"#).is_err());
        assert!(serde_json::from_str::<RebuildJob>("not json").is_err());
    }
}
