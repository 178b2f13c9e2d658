//! Package registration and the dependency-publish gate.
//!
//! A new version becomes a row here and becomes *visible* only later, when
//! a rebuild pipeline durably includes it in a snapshot. The gate enforces
//! the ordering that makes that safe: every declared dependency must already
//! exist and already be published before the new version row is inserted.

use fred::clients::Pool;
use sqlx::PgPool;
use tracing::{info, instrument};

use crate::assign::shard_for_package;
use crate::coordination::queue::{self, RebuildJob};
use crate::db::models::{
    DependencyRef, NewPackage, NewPackageVersion, Package, PackageVersion,
};
use crate::db::packages;
use crate::error::{RegistryError, Result};

// ---------------------------------------------------------------------------
// Gate validation (pure)
// ---------------------------------------------------------------------------

/// Validate a version's declared dependencies against the rows the batch
/// fetch resolved.
///
/// Checks run per declared dependency, in declaration order:
/// 1. self-reference, rejected before any publication state is consulted;
/// 2. unresolved reference (no stored row at all), [`RegistryError::DependencyNotFound`],
///    deliberately distinct from the unpublished case;
/// 3. resolved but `published = false`, [`RegistryError::DependencyNotPublished`].
pub fn check_dependencies(
    package_id: &str,
    version: &str,
    declared: &[DependencyRef],
    resolved: &[PackageVersion],
) -> Result<()> {
    for dep in declared {
        if dep.package_id == package_id {
            return Err(RegistryError::SelfDependency {
                package_id: package_id.to_string(),
                version: version.to_string(),
                dependency: format!("{}=={}", dep.package_id, dep.version),
            });
        }

        let row = resolved
            .iter()
            .find(|r| r.package_id == dep.package_id && r.version == dep.version)
            .ok_or_else(|| RegistryError::DependencyNotFound {
                package_id: dep.package_id.clone(),
                version: dep.version.clone(),
            })?;

        if !row.published {
            return Err(RegistryError::DependencyNotPublished {
                package_id: row.package_id.clone(),
                version: row.version.clone(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Service operations
// ---------------------------------------------------------------------------

/// Register a new package. The shard assignment is computed here, once, and
/// is fixed for the package's lifetime.
#[instrument(skip(pool, new), fields(package_id = %new.id))]
pub async fn create_package(pool: &PgPool, new: &NewPackage, shard_count: u32) -> Result<Package> {
    let shard_id = shard_for_package(&new.id, shard_count);
    let package = packages::insert_package(pool, new, shard_id).await?;
    info!(shard_id, meta = new.meta, "package created");
    Ok(package)
}

/// Create a new package version behind the publish gate, then trigger the
/// rebuilds that will eventually make it visible.
///
/// The inserted row starts `published = false`; only a pipeline commit that
/// includes it in a durable snapshot flips the flag.
#[instrument(skip(pool, keydb, new), fields(%package_id, version = %new.version))]
pub async fn create_package_version(
    pool: &PgPool,
    keydb: &Pool,
    package_id: &str,
    new: &NewPackageVersion,
) -> Result<PackageVersion> {
    // One query resolves every declared dependency.
    let resolved = packages::fetch_dependency_rows(pool, &new.dependencies).await?;

    // Ensures the target package exists before the gate runs.
    let package = packages::get_package(pool, package_id).await?;

    check_dependencies(package_id, &new.version, &new.dependencies, &resolved)?;

    let inserted = packages::insert_version_with_dependencies(pool, package_id, new).await?;

    // The affected shard plus the whole-registry index. The queue is
    // at-least-once; pipelines are idempotent via generation-addressed keys.
    queue::enqueue(
        keydb,
        RebuildJob::ShardRebuild {
            shard_id: package.shard_id as u32,
        },
    )
    .await?;
    queue::enqueue(keydb, RebuildJob::IndexRebuild).await?;

    info!(shard_id = package.shard_id, "version created, rebuilds enqueued");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(package_id: &str, version: &str) -> DependencyRef {
        DependencyRef {
            package_id: package_id.to_string(),
            version: version.to_string(),
        }
    }

    fn row(package_id: &str, version: &str, published: bool) -> PackageVersion {
        PackageVersion {
            package_id: package_id.to_string(),
            version: version.to_string(),
            url: format!("https://cdn.example.com/{package_id}-{version}"),
            published,
        }
    }

    #[test]
    fn test_no_dependencies_passes() {
        assert!(check_dependencies("left-pad", "1.0.0", &[], &[]).is_ok());
    }

    #[test]
    fn test_all_published_dependencies_pass() {
        let declared = [dep("c", "1.0"), dep("d", "2.0")];
        let resolved = [row("c", "1.0", true), row("d", "2.0", true)];
        assert!(check_dependencies("b", "2.0", &declared, &resolved).is_ok());
    }

    #[test]
    fn test_self_dependency_rejected_before_publication_check() {
        // The self-referenced row is resolved and even "published"; the
        // self check must still fire first.
        let declared = [dep("a", "1.0")];
        let resolved = [row("a", "1.0", true)];
        let err = check_dependencies("a", "1.0", &declared, &resolved).unwrap_err();
        match err {
            RegistryError::SelfDependency { dependency, .. } => {
                assert_eq!(dependency, "a==1.0");
            }
            other => panic!("expected SelfDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_unpublished_dependency_rejected() {
        let declared = [dep("c", "1.0")];
        let resolved = [row("c", "1.0", false)];
        let err = check_dependencies("b", "2.0", &declared, &resolved).unwrap_err();
        assert!(matches!(err, RegistryError::DependencyNotPublished { .. }));
    }

    #[test]
    fn test_missing_dependency_is_not_found_not_unpublished() {
        let declared = [dep("ghost", "9.9")];
        let err = check_dependencies("b", "2.0", &declared, &[]).unwrap_err();
        assert!(matches!(err, RegistryError::DependencyNotFound { .. }));
    }

    #[test]
    fn test_version_mismatch_counts_as_missing() {
        // The package exists but not at the declared version.
        let declared = [dep("c", "2.0")];
        let resolved = [row("c", "1.0", true)];
        let err = check_dependencies("b", "1.0", &declared, &resolved).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DependencyNotFound { ref version, .. } if version == "2.0"
        ));
    }

    #[test]
    fn test_first_failing_dependency_wins() {
        let declared = [dep("c", "1.0"), dep("b", "1.0")];
        let resolved = [row("c", "1.0", false), row("b", "1.0", true)];
        let err = check_dependencies("b", "2.0", &declared, &resolved).unwrap_err();
        // "b" depending on itself would be SelfDependency, but "c" is
        // checked first and fails on publication state.
        assert!(matches!(
            err,
            RegistryError::DependencyNotPublished { ref package_id, .. } if package_id == "c"
        ));
    }
}
