//! Domain error taxonomy for the registry rebuild service.
//!
//! Caller-facing conditions (duplicates, missing rows, dependency gate
//! rejections) are distinct variants so the API layer can map them to
//! precise responses. Coordination and pipeline failures carry enough
//! context to decide whether a rebuild job is worth re-dispatching.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("package '{package_id}' already exists")]
    PackageAlreadyExists { package_id: String },

    #[error("version '{version}' already exists for package '{package_id}'")]
    VersionAlreadyExists { package_id: String, version: String },

    #[error("package '{package_id}' not found")]
    PackageNotFound { package_id: String },

    /// A rebuild referenced a shard row that was never provisioned. Not
    /// retriable: the configured count, not time, decides which shards
    /// exist.
    #[error("shard {shard_id} is not provisioned")]
    ShardNotFound { shard_id: u32 },

    /// A declared dependency that does not resolve to any stored version.
    /// Distinct from [`RegistryError::DependencyNotPublished`]: the row does
    /// not exist at all.
    #[error("dependency '{package_id}=={version}' does not exist")]
    DependencyNotFound { package_id: String, version: String },

    #[error("version '{package_id}=={version}' declares itself as a dependency ({dependency})")]
    SelfDependency {
        package_id: String,
        version: String,
        dependency: String,
    },

    #[error("dependency '{package_id}=={version}' is not yet published")]
    DependencyNotPublished { package_id: String, version: String },

    /// Exclusive rebuild access could not be obtained within the allotted
    /// wait. Swallowed (logged) at the pipeline level, never auto-retried.
    #[error("timed out after {waited:?} waiting for lock '{name}'")]
    LockTimeout { name: String, waited: Duration },

    /// Release or renew attempted by an instance whose owner token no longer
    /// matches the stored one (never held, or lost to expiry).
    #[error("lock '{name}' is not held by this instance")]
    LockNotHeld { name: String },

    /// Blob store write failed. Durable state is unchanged; the rebuild job
    /// is safe to re-dispatch.
    #[error("snapshot upload failed")]
    Upload(#[source] anyhow::Error),

    /// Post-upload database transaction failed. The uploaded blob is keyed
    /// by generation, so re-running the pipeline is idempotent.
    #[error("snapshot commit failed")]
    Commit(#[source] anyhow::Error),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    /// KeyDB/coordination backend failure (connection loss, script error).
    #[error("coordination backend error")]
    Coordination(#[source] anyhow::Error),
}

impl RegistryError {
    /// Whether a failed rebuild job should be pushed back onto the queue.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Upload(_) | Self::Commit(_) | Self::Database(_) | Self::Coordination(_)
        )
    }
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_errors_are_distinct() {
        let missing = RegistryError::DependencyNotFound {
            package_id: "c".into(),
            version: "1.0".into(),
        };
        let unpublished = RegistryError::DependencyNotPublished {
            package_id: "c".into(),
            version: "1.0".into(),
        };
        assert_eq!(missing.to_string(), "dependency 'c==1.0' does not exist");
        assert_eq!(
            unpublished.to_string(),
            "dependency 'c==1.0' is not yet published"
        );
    }

    #[test]
    fn test_retriable_classification() {
        assert!(RegistryError::Upload(anyhow::anyhow!("boom")).is_retriable());
        assert!(RegistryError::Commit(anyhow::anyhow!("boom")).is_retriable());
        assert!(!RegistryError::LockTimeout {
            name: "shardgen:shard:3:lock".into(),
            waited: Duration::from_secs(60),
        }
        .is_retriable());
        assert!(!RegistryError::SelfDependency {
            package_id: "a".into(),
            version: "1.0".into(),
            dependency: "a==1.0".into(),
        }
        .is_retriable());
        assert!(!RegistryError::ShardNotFound { shard_id: 99 }.is_retriable());
    }

    #[test]
    fn test_missing_shard_is_its_own_condition() {
        let err = RegistryError::ShardNotFound { shard_id: 7 };
        assert_eq!(err.to_string(), "shard 7 is not provisioned");
    }
}
