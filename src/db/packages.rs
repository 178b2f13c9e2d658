//! Package and version queries.

use sqlx::{PgPool, QueryBuilder};

use crate::db::models::{DependencyRef, NewPackage, NewPackageVersion, Package, PackageVersion};
use crate::error::{RegistryError, Result};

/// True when the underlying database error is a unique-constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

pub async fn get_package(pool: &PgPool, package_id: &str) -> Result<Package> {
    let package = sqlx::query_as::<_, Package>(
        "SELECT id, description, meta, shard_id FROM package WHERE id = $1",
    )
    .bind(package_id)
    .fetch_optional(pool)
    .await?;

    package.ok_or_else(|| RegistryError::PackageNotFound {
        package_id: package_id.to_string(),
    })
}

pub async fn list_packages(pool: &PgPool) -> Result<Vec<Package>> {
    let packages = sqlx::query_as::<_, Package>(
        "SELECT id, description, meta, shard_id FROM package ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(packages)
}

pub async fn list_versions(pool: &PgPool, package_id: &str) -> Result<Vec<PackageVersion>> {
    // Surface PackageNotFound rather than an empty list for unknown ids.
    let _ = get_package(pool, package_id).await?;

    let versions = sqlx::query_as::<_, PackageVersion>(
        "SELECT package_id, version, url, published \
         FROM package_version WHERE package_id = $1 ORDER BY version",
    )
    .bind(package_id)
    .fetch_all(pool)
    .await?;
    Ok(versions)
}

/// Insert a package row plus its tag rows in one transaction.
///
/// A duplicate identifier maps to [`RegistryError::PackageAlreadyExists`]
/// rather than a generic storage error.
pub async fn insert_package(pool: &PgPool, new: &NewPackage, shard_id: u32) -> Result<Package> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query_as::<_, Package>(
        "INSERT INTO package (id, description, meta, shard_id) \
         VALUES ($1, $2, $3, $4) \
         RETURNING id, description, meta, shard_id",
    )
    .bind(&new.id)
    .bind(&new.description)
    .bind(new.meta)
    .bind(shard_id as i32)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            RegistryError::PackageAlreadyExists {
                package_id: new.id.clone(),
            }
        } else {
            err.into()
        }
    })?;

    for tag in &new.tags {
        sqlx::query("INSERT INTO package_tag (package_id, tag) VALUES ($1, $2)")
            .bind(&new.id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Batch-fetch the stored rows for a set of declared dependencies in a
/// single query. Rows that do not exist are simply absent from the result;
/// the publish gate treats absence as its own error condition.
pub async fn fetch_dependency_rows(
    pool: &PgPool,
    dependencies: &[DependencyRef],
) -> Result<Vec<PackageVersion>> {
    if dependencies.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder = QueryBuilder::new(
        "SELECT package_id, version, url, published \
         FROM package_version WHERE (package_id, version) IN ",
    );
    builder.push_tuples(dependencies, |mut b, dep| {
        b.push_bind(&dep.package_id).push_bind(&dep.version);
    });

    let rows = builder
        .build_query_as::<PackageVersion>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Insert a version row plus its dependency edges in one transaction.
///
/// The publish gate has already validated the dependencies by the time this
/// runs; a concurrent duplicate insert maps to
/// [`RegistryError::VersionAlreadyExists`].
pub async fn insert_version_with_dependencies(
    pool: &PgPool,
    package_id: &str,
    new: &NewPackageVersion,
) -> Result<PackageVersion> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query_as::<_, PackageVersion>(
        "INSERT INTO package_version (package_id, version, url, published) \
         VALUES ($1, $2, $3, FALSE) \
         RETURNING package_id, version, url, published",
    )
    .bind(package_id)
    .bind(&new.version)
    .bind(&new.url)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            RegistryError::VersionAlreadyExists {
                package_id: package_id.to_string(),
                version: new.version.clone(),
            }
        } else {
            err.into()
        }
    })?;

    for dep in &new.dependencies {
        sqlx::query(
            "INSERT INTO package_version_dependency \
             (package_id, version, dependency_id, dependency_version) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(package_id)
        .bind(&new.version)
        .bind(&dep.package_id)
        .bind(&dep.version)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(inserted)
}
