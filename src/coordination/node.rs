//! Worker identity and liveness heartbeat.

use std::time::Duration;

use anyhow::{Context, Result};
use fred::interfaces::{HashesInterface, KeysInterface};
use tracing::{debug, error, info};

/// Derive a stable-ish worker identifier: `<hostname>-<random-8-chars>`, so
/// that every rebuild worker process gets a unique id even on the same host.
pub fn worker_id() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let suffix = &uuid::Uuid::new_v4().to_string()[..8];
    format!("{hostname}-{suffix}")
}

fn worker_key(worker_id: &str) -> String {
    format!("shardgen:worker:{worker_id}")
}

/// Run the heartbeat loop.
///
/// Writes a HASH at `shardgen:worker:{worker_id}` with a 30-second TTL every
/// 10 seconds. If the process crashes the key expires and the worker drops
/// out of the fleet view; any locks it held self-clear through their own
/// expiry. This function never returns under normal operation.
pub async fn run_heartbeat(pool: fred::clients::Pool, worker_id: String) {
    info!(%worker_id, "starting heartbeat loop");
    let key = worker_key(&worker_id);
    loop {
        if let Err(e) = heartbeat_once(&pool, &key).await {
            error!(error = %e, %worker_id, "heartbeat tick failed");
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}

async fn heartbeat_once(pool: &fred::clients::Pool, key: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp().to_string();
    let _: () = pool
        .hset(
            key,
            vec![
                ("last_seen".to_string(), now),
                ("status".to_string(), "active".to_string()),
            ],
        )
        .await
        .context("HSET heartbeat")?;
    let _: bool = pool
        .expire(key, 30, None)
        .await
        .context("EXPIRE heartbeat key")?;
    debug!(%key, "heartbeat tick");
    Ok(())
}

/// Remove this worker's heartbeat key immediately (graceful shutdown).
pub async fn deregister_worker(pool: &fred::clients::Pool, worker_id: &str) -> Result<()> {
    let _: i64 = pool
        .del(worker_key(worker_id))
        .await
        .context("DEL worker key")?;
    info!(%worker_id, "worker deregistered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_are_unique() {
        let a = worker_id();
        let b = worker_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_worker_key_prefix() {
        assert_eq!(worker_key("host-abc123"), "shardgen:worker:host-abc123");
    }
}
