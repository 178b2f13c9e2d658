//! Row models and service-layer input types.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered package. `shard_id` is derived from the identifier at
/// creation time and never changes afterwards.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Package {
    pub id: String,
    pub description: Option<String>,
    /// Meta packages are excluded from shard and index snapshots.
    pub meta: bool,
    pub shard_id: i32,
}

/// One uploaded version of a package. `published` starts false and flips to
/// true exactly once, after a rebuild commit whose snapshot includes it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PackageVersion {
    pub package_id: String,
    pub version: String,
    pub url: String,
    pub published: bool,
}

/// A declared dependency edge, stored atomically with the version that
/// declares it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DependencyEdge {
    pub package_id: String,
    pub version: String,
    pub dependency_id: String,
    pub dependency_version: String,
}

/// One partition of the package catalog. `location` points at the latest
/// committed snapshot; `generation` counts committed rebuilds.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Shard {
    pub id: i32,
    pub location: String,
    pub generation: i64,
}

// ---------------------------------------------------------------------------
// Service inputs
// ---------------------------------------------------------------------------

/// Reference to a `(package_id, version)` pair as declared in a version's
/// dependency list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyRef {
    pub package_id: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPackage {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPackageVersion {
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
}
