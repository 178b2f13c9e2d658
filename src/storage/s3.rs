use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

const SHARDS_PREFIX: &str = "shards";

// ---------------------------------------------------------------------------
// Snapshot key derivation
// ---------------------------------------------------------------------------

/// Object key for one shard generation: `shards/{shard_id}_{generation}`.
///
/// Keys are immutable once written: a generation's content is never
/// overwritten, only superseded by the next generation's key. This is what
/// makes re-running a rebuild after a commit failure harmless.
pub fn shard_snapshot_key(shard_id: u32, generation: i64) -> String {
    format!("{SHARDS_PREFIX}/{shard_id}_{generation}")
}

/// Object key for a whole-index snapshot, derived from the build time. The
/// index has no generation counter; the timestamp keeps keys unique and
/// sortable.
pub fn index_snapshot_key(built_at: DateTime<Utc>) -> String {
    format!("index_{}", built_at.format("%Y%m%dT%H%M%SZ"))
}

// ---------------------------------------------------------------------------
// SnapshotStorage
// ---------------------------------------------------------------------------

/// High-level wrapper around the S3 bucket that holds registry snapshots.
pub struct SnapshotStorage {
    client: Client,
    bucket: String,
    public_base_url: String,
}

impl SnapshotStorage {
    pub fn new(client: Client, bucket: String, public_base_url: String) -> Self {
        Self {
            client,
            bucket,
            public_base_url,
        }
    }

    /// Public URL registry clients use to download the object at `key`.
    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    /// Upload snapshot bytes to `key` and return the public URL that should
    /// be written into the shard's `location` column.
    pub async fn put_snapshot(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        put_object(&self.client, &self.bucket, key, bytes).await?;
        Ok(self.public_url(key))
    }

    /// Check whether a snapshot object already exists (HEAD request). Used
    /// by tooling to verify a commit's location before trusting it.
    pub async fn snapshot_exists(&self, key: &str) -> Result<bool> {
        object_exists(&self.client, &self.bucket, key).await
    }

    /// HEAD the bucket itself. Health-check probe.
    pub async fn bucket_reachable(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .context("S3 HeadBucket")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free functions operating on explicit bucket / key parameters.
// ---------------------------------------------------------------------------

/// Upload a byte payload to S3.
#[instrument(skip(client, bytes), fields(%bucket, %key, len = bytes.len()))]
pub async fn put_object(client: &Client, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
    let body = ByteStream::from(bytes);

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .content_type("application/msgpack")
        .send()
        .await
        .context("S3 PutObject")?;

    debug!("snapshot uploaded");
    Ok(())
}

/// Check whether an object exists in S3 (HEAD request).
#[instrument(skip(client), fields(%bucket, %key))]
pub async fn object_exists(client: &Client, bucket: &str, key: &str) -> Result<bool> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => Ok(true),
        Err(err) => {
            // The SDK returns a service error with code "NotFound" (or an
            // HTTP 404) when the object does not exist.
            if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                Ok(false)
            } else {
                Err(err).context("S3 HeadObject")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_shard_snapshot_key_format() {
        assert_eq!(shard_snapshot_key(3, 0), "shards/3_0");
        assert_eq!(shard_snapshot_key(15, 42), "shards/15_42");
    }

    #[test]
    fn test_consecutive_generations_never_collide() {
        for generation in 0..100 {
            assert_ne!(
                shard_snapshot_key(7, generation),
                shard_snapshot_key(7, generation + 1)
            );
        }
    }

    #[test]
    fn test_index_snapshot_key_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 30, 5).unwrap();
        assert_eq!(index_snapshot_key(at), "index_20240309T143005Z");
    }
}
