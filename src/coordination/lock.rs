//! Distributed mutual exclusion over KeyDB keys.
//!
//! A [`DistributedLock`] owns a named key for as long as the stored value
//! equals the random token generated at acquisition. Acquisition is a single
//! `SET NX EX`; release and expiry refresh are Lua scripts so that "check
//! token, then act" is one indivisible step against the backend. The expiry
//! is a crash-recovery failsafe: a holder that dies without releasing stops
//! blocking the resource once the TTL lapses.

use std::time::Duration;

use anyhow::Context;
use fred::clients::Pool;
use fred::interfaces::{KeysInterface, LuaInterface};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RegistryError, Result};

/// Delete the key only when the stored token still matches ours.
const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        redis.call('DEL', KEYS[1])
        return 1
    end
    return 0
"#;

/// Refresh the key's expiry only when the stored token still matches ours.
const REFRESH_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        redis.call('EXPIRE', KEYS[1], ARGV[2])
        return 1
    end
    return 0
"#;

// ---------------------------------------------------------------------------
// Lock key naming
// ---------------------------------------------------------------------------

/// Primary rebuild lock for one shard.
pub fn shard_lock_key(shard_id: u32) -> String {
    format!("shardgen:shard:{shard_id}:lock")
}

/// Pending-intent lock for one shard: held briefly to signal "a rebuild is
/// queued behind the current one".
pub fn shard_pending_lock_key(shard_id: u32) -> String {
    format!("shardgen:shard:{shard_id}:lock:next")
}

/// Global whole-index rebuild lock.
pub fn index_lock_key() -> String {
    "shardgen:index:lock".to_string()
}

// ---------------------------------------------------------------------------
// DistributedLock
// ---------------------------------------------------------------------------

pub struct DistributedLock {
    pool: Pool,
    name: String,
    expire: Duration,
    owner: Option<String>,
}

impl DistributedLock {
    pub fn new(pool: Pool, name: impl Into<String>, expire: Duration) -> Self {
        Self {
            pool,
            name: name.into(),
            expire,
            owner: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this instance currently believes it holds the lock. Local
    /// state only; the authoritative check is the token stored in KeyDB.
    pub fn is_held(&self) -> bool {
        self.owner.is_some()
    }

    /// Single non-blocking acquisition attempt via `SET NX EX`. Returns
    /// `true` when the lock was obtained.
    pub async fn try_acquire(&mut self) -> Result<bool> {
        let token = Uuid::new_v4().to_string();
        let result: Option<String> = self
            .pool
            .set(
                &self.name,
                token.as_str(),
                Some(fred::types::Expiration::EX(self.expire.as_secs() as i64)),
                Some(fred::types::SetOptions::NX),
                false,
            )
            .await
            .map_err(lock_backend_error)?;

        // SET ... NX returns OK when the key was set, nil otherwise.
        let acquired = result.is_some();
        if acquired {
            self.owner = Some(token);
        }
        debug!(name = %self.name, acquired, "lock acquisition attempt");
        Ok(acquired)
    }

    /// Blocking acquisition: polls [`Self::try_acquire`] on `retry_interval`
    /// until success or `timeout` elapses, then fails with
    /// [`RegistryError::LockTimeout`].
    pub async fn acquire(&mut self, timeout: Duration, retry_interval: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_acquire().await? {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(name = %self.name, ?timeout, "timed out waiting for lock");
                return Err(RegistryError::LockTimeout {
                    name: self.name.clone(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(retry_interval.min(remaining)).await;
        }
    }

    /// Release the lock. Fails with [`RegistryError::LockNotHeld`] when this
    /// instance never acquired it or lost it to expiry; in that case the key
    /// is left untouched.
    ///
    /// A backend failure keeps the token, so a retry can still settle the
    /// release; expiry bounds the leak if no retry ever succeeds.
    pub async fn release(&mut self) -> Result<()> {
        let token = match self.owner {
            Some(ref token) => token.clone(),
            None => {
                return Err(RegistryError::LockNotHeld {
                    name: self.name.clone(),
                })
            }
        };

        let released: i64 = self
            .pool
            .eval(
                RELEASE_SCRIPT,
                vec![self.name.clone()],
                vec![token],
            )
            .await
            .map_err(lock_backend_error)?;

        self.settle_release(released)
    }

    /// Apply the backend's release verdict. Ownership ends on either branch:
    /// a token mismatch means the lock was already lost to expiry.
    fn settle_release(&mut self, released: i64) -> Result<()> {
        self.owner = None;
        if released != 1 {
            warn!(name = %self.name, "release: token mismatch, lock was lost to expiry");
            return Err(RegistryError::LockNotHeld {
                name: self.name.clone(),
            });
        }
        debug!(name = %self.name, "lock released");
        Ok(())
    }

    /// Re-arm the configured expiry without giving up ownership. Used to
    /// extend a long-running build past its initial TTL.
    pub async fn renew(&self) -> Result<()> {
        self.refresh_expiry(self.expire).await
    }

    /// Schedule the lock to release itself after `ttl` and forget local
    /// ownership. This is how post-commit cooldown works: exclusivity is
    /// kept by the backend timer instead of a worker sleeping with the lock.
    pub async fn hold_for(&mut self, ttl: Duration) -> Result<()> {
        self.refresh_expiry(ttl).await?;
        self.owner = None;
        Ok(())
    }

    async fn refresh_expiry(&self, ttl: Duration) -> Result<()> {
        let token = self.owner.as_ref().ok_or_else(|| RegistryError::LockNotHeld {
            name: self.name.clone(),
        })?;

        let refreshed: i64 = self
            .pool
            .eval(
                REFRESH_SCRIPT,
                vec![self.name.clone()],
                vec![token.clone(), ttl.as_secs().to_string()],
            )
            .await
            .map_err(lock_backend_error)?;

        if refreshed != 1 {
            return Err(RegistryError::LockNotHeld {
                name: self.name.clone(),
            });
        }
        debug!(name = %self.name, ttl_secs = ttl.as_secs(), "lock expiry refreshed");
        Ok(())
    }

    /// Non-authoritative observation of whether anyone holds the lock.
    pub async fn locked(&self) -> Result<bool> {
        let exists: bool = self
            .pool
            .exists(&self.name)
            .await
            .map_err(lock_backend_error)?;
        Ok(exists)
    }
}

/// Whether some worker currently holds a shard's primary rebuild lock. Used
/// by the pending sweep to avoid re-enqueueing shards that are mid-rebuild.
pub async fn shard_rebuild_active(pool: &Pool, shard_id: u32) -> Result<bool> {
    let exists: bool = pool
        .exists(shard_lock_key(shard_id))
        .await
        .map_err(lock_backend_error)?;
    Ok(exists)
}

fn lock_backend_error(err: impl Into<anyhow::Error>) -> RegistryError {
    RegistryError::Coordination(err.into().context("lock backend operation failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_naming() {
        assert_eq!(shard_lock_key(0), "shardgen:shard:0:lock");
        assert_eq!(shard_lock_key(15), "shardgen:shard:15:lock");
        assert_eq!(shard_pending_lock_key(15), "shardgen:shard:15:lock:next");
        assert_eq!(index_lock_key(), "shardgen:index:lock");
    }

    #[test]
    fn test_pending_key_is_distinct_from_primary() {
        for id in 0..64 {
            assert_ne!(shard_lock_key(id), shard_pending_lock_key(id));
        }
    }

    // Client objects exist without a live backend as long as no command is
    // issued; these tests only exercise paths that return before the first
    // backend call.
    fn offline_pool() -> Pool {
        fred::types::Builder::default_centralized()
            .build_pool(2)
            .expect("pool construction")
    }

    fn offline_lock(name: &str) -> DistributedLock {
        DistributedLock::new(offline_pool(), name, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_release_without_ownership_is_rejected() {
        let mut lock = offline_lock("shardgen:shard:9:lock");
        assert!(!lock.is_held());
        assert!(matches!(
            lock.release().await,
            Err(RegistryError::LockNotHeld { ref name }) if name == "shardgen:shard:9:lock"
        ));
    }

    #[tokio::test]
    async fn test_renew_without_ownership_is_rejected() {
        let lock = offline_lock("shardgen:index:lock");
        assert!(matches!(
            lock.renew().await,
            Err(RegistryError::LockNotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_hold_for_without_ownership_is_rejected() {
        let mut lock = offline_lock("shardgen:shard:3:lock");
        assert!(matches!(
            lock.hold_for(Duration::from_secs(60)).await,
            Err(RegistryError::LockNotHeld { .. })
        ));
    }

    #[test]
    fn test_settle_release_ends_ownership_on_success() {
        let mut lock = offline_lock("shardgen:shard:1:lock");
        lock.owner = Some("token-a".to_string());
        assert!(lock.settle_release(1).is_ok());
        assert!(!lock.is_held());
    }

    #[test]
    fn test_settle_release_reports_lost_lock_on_token_mismatch() {
        // The backend answered, but with someone else's token stored: the
        // lock expired and was re-acquired. Ownership still ends locally.
        let mut lock = offline_lock("shardgen:shard:1:lock");
        lock.owner = Some("token-a".to_string());
        assert!(matches!(
            lock.settle_release(0),
            Err(RegistryError::LockNotHeld { .. })
        ));
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_token_for_retry() {
        // The pool was never initialised, so the eval cannot reach any
        // backend. Whatever way that surfaces (immediate error or a stalled
        // command future), the owner token must survive: only a backend
        // verdict ends ownership.
        let mut lock = offline_lock("shardgen:shard:2:lock");
        lock.owner = Some("token-b".to_string());
        let outcome =
            tokio::time::timeout(Duration::from_millis(500), lock.release()).await;
        if let Ok(result) = outcome {
            assert!(matches!(result, Err(RegistryError::Coordination(_))));
        }
        assert!(lock.is_held(), "token must survive a failed release");
    }
}
