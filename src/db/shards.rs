//! Shard rows and the rebuild commit transaction.

use std::collections::BTreeMap;

use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::db::models::{PackageVersion, Shard};
use crate::error::{RegistryError, Result};

/// Idempotently create shard rows `0..count`. Runs at startup; existing rows
/// (and their generations) are left untouched.
pub async fn provision_shards(pool: &PgPool, count: u32) -> Result<()> {
    let mut builder =
        QueryBuilder::new("INSERT INTO shard (id, location, generation) ");
    builder.push_values(0..count as i32, |mut b, id| {
        b.push_bind(id).push_bind("").push_bind(0i64);
    });
    builder.push(" ON CONFLICT (id) DO NOTHING");

    let result = builder.build().execute(pool).await?;
    if result.rows_affected() > 0 {
        info!(created = result.rows_affected(), count, "provisioned shard rows");
    }
    Ok(())
}

pub async fn get_shard(pool: &PgPool, shard_id: u32) -> Result<Shard> {
    let shard = sqlx::query_as::<_, Shard>(
        "SELECT id, location, generation FROM shard WHERE id = $1",
    )
    .bind(shard_id as i32)
    .fetch_optional(pool)
    .await?;

    shard.ok_or(RegistryError::ShardNotFound { shard_id })
}

/// All versions of the non-meta packages assigned to one shard, grouped by
/// package id and ordered by version. This is the input to a shard snapshot.
pub async fn shard_package_versions(
    pool: &PgPool,
    shard_id: u32,
) -> Result<BTreeMap<String, Vec<PackageVersion>>> {
    let rows = sqlx::query_as::<_, PackageVersion>(
        "SELECT v.package_id, v.version, v.url, v.published \
         FROM package_version v \
         JOIN package p ON p.id = v.package_id \
         WHERE p.shard_id = $1 AND p.meta = FALSE \
         ORDER BY v.package_id, v.version",
    )
    .bind(shard_id as i32)
    .fetch_all(pool)
    .await?;

    Ok(group_by_package(rows))
}

/// All versions of every non-meta package in the registry. Input to the
/// whole-index snapshot.
pub async fn all_package_versions(pool: &PgPool) -> Result<BTreeMap<String, Vec<PackageVersion>>> {
    let rows = sqlx::query_as::<_, PackageVersion>(
        "SELECT v.package_id, v.version, v.url, v.published \
         FROM package_version v \
         JOIN package p ON p.id = v.package_id \
         WHERE p.meta = FALSE \
         ORDER BY v.package_id, v.version",
    )
    .fetch_all(pool)
    .await?;

    Ok(group_by_package(rows))
}

fn group_by_package(rows: Vec<PackageVersion>) -> BTreeMap<String, Vec<PackageVersion>> {
    let mut grouped: BTreeMap<String, Vec<PackageVersion>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.package_id.clone()).or_default().push(row);
    }
    grouped
}

/// The all-or-nothing commit step of a shard rebuild: advance the shard's
/// generation by exactly one, point its location at the freshly uploaded
/// snapshot, and flip `published` for exactly the versions that snapshot
/// contains.
///
/// The generation update is guarded by the generation the build step read
/// (`expected_generation`); if another run advanced it in the meantime the
/// whole transaction rolls back and the caller reports a commit failure.
pub async fn commit_shard_generation(
    pool: &PgPool,
    shard_id: u32,
    expected_generation: i64,
    location: &str,
    included: &[(String, String)],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE shard SET generation = generation + 1, location = $1 \
         WHERE id = $2 AND generation = $3",
    )
    .bind(location)
    .bind(shard_id as i32)
    .bind(expected_generation)
    .execute(&mut *tx)
    .await?;

    if let Err(e) =
        ensure_generation_unchanged(updated.rows_affected(), shard_id, expected_generation)
    {
        tx.rollback().await?;
        return Err(e);
    }

    if !included.is_empty() {
        let mut builder = QueryBuilder::new(
            "UPDATE package_version SET published = TRUE WHERE (package_id, version) IN ",
        );
        builder.push_tuples(included, |mut b, (package_id, version)| {
            b.push_bind(package_id).push_bind(version);
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Verdict on the guarded generation update: exactly one row must have
/// matched the expected generation. Zero matches means another run advanced
/// the counter after this run's build read, so committing would skip a
/// generation or clobber a newer snapshot's location.
fn ensure_generation_unchanged(
    rows_affected: u64,
    shard_id: u32,
    expected_generation: i64,
) -> Result<()> {
    if rows_affected == 1 {
        return Ok(());
    }
    Err(RegistryError::Commit(anyhow::anyhow!(
        "shard {shard_id} generation moved past {expected_generation} during rebuild"
    )))
}

/// Mark every listed version published. Used by the index pipeline, which
/// has no generation counter to advance.
pub async fn mark_versions_published(pool: &PgPool, included: &[(String, String)]) -> Result<()> {
    if included.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::new(
        "UPDATE package_version SET published = TRUE WHERE (package_id, version) IN ",
    );
    builder.push_tuples(included, |mut b, (package_id, version)| {
        b.push_bind(package_id).push_bind(version);
    });
    builder.build().execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_guard_accepts_exactly_one_matched_row() {
        assert!(ensure_generation_unchanged(1, 3, 5).is_ok());
    }

    #[test]
    fn test_commit_guard_rejects_stale_generation() {
        // Zero rows matched the expected generation: another run committed
        // in between. The whole transaction must fail as a commit error.
        let err = ensure_generation_unchanged(0, 7, 3).unwrap_err();
        assert!(matches!(err, RegistryError::Commit(_)));
        let source = std::error::Error::source(&err)
            .expect("commit error carries its cause")
            .to_string();
        assert!(source.contains("shard 7 generation moved past 3"));
    }

    #[test]
    fn test_stale_generation_commit_is_safe_to_retry() {
        // Snapshot keys embed the generation, so re-running after a guarded
        // rollback cannot clobber anything already committed.
        let err = ensure_generation_unchanged(0, 0, 12).unwrap_err();
        assert!(err.is_retriable());
    }
}
