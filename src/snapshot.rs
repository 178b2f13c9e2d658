//! Snapshot assembly and binary encoding.
//!
//! A snapshot is the immutable payload clients download instead of querying
//! the registry database: a mapping from package identifier to the ordered
//! list of that package's versions with their artifact URLs. The wire form
//! is MessagePack, matching what registry clients already parse; keys are
//! kept in a `BTreeMap` so identical logical content always serializes to
//! identical bytes regardless of how rows came back from the database.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One `{version, url}` record inside a package's version list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    pub url: String,
}

/// An assembled snapshot, ready to encode and upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    packages: BTreeMap<String, Vec<VersionEntry>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a package and its version list. Version order is preserved as
    /// given (the database queries order by version ascending).
    pub fn insert_package(&mut self, package_id: impl Into<String>, versions: Vec<VersionEntry>) {
        self.packages.insert(package_id.into(), versions);
    }

    /// Assemble a snapshot from grouped version rows as the shard and index
    /// queries return them. Every row is carried regardless of its current
    /// `published` state: the commit step flips publication for exactly the
    /// pairs [`Self::included_versions`] reports, nothing else.
    pub fn from_version_rows(
        grouped: BTreeMap<String, Vec<crate::db::models::PackageVersion>>,
    ) -> Self {
        let mut snapshot = Self::new();
        for (package_id, versions) in grouped {
            snapshot.insert_package(
                package_id,
                versions
                    .into_iter()
                    .map(|v| VersionEntry {
                        version: v.version,
                        url: v.url,
                    })
                    .collect(),
            );
        }
        snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn versions(&self, package_id: &str) -> Option<&[VersionEntry]> {
        self.packages.get(package_id).map(Vec::as_slice)
    }

    /// Every `(package_id, version)` pair contained in this snapshot. These
    /// are exactly the rows whose `published` flag the commit step flips.
    pub fn included_versions(&self) -> Vec<(String, String)> {
        self.packages
            .iter()
            .flat_map(|(id, versions)| {
                versions
                    .iter()
                    .map(move |v| (id.clone(), v.version.clone()))
            })
            .collect()
    }

    /// Serialize to the compact MessagePack wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(&self.packages).context("msgpack-encode snapshot")
    }

    /// Decode a previously uploaded snapshot. Used by tests and tooling; the
    /// service itself only writes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let packages = rmp_serde::from_slice(bytes).context("msgpack-decode snapshot")?;
        Ok(Self { packages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: &str, url: &str) -> VersionEntry {
        VersionEntry {
            version: version.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_package(
            "left-pad",
            vec![entry("1.0.0", "https://cdn.example.com/left-pad-1.0.0.tar.gz")],
        );
        snapshot.insert_package(
            "requests",
            vec![entry("2.31.0", "https://cdn.example.com/requests-2.31.0.whl")],
        );

        let bytes = snapshot.encode().expect("encode");
        let decoded = Snapshot::decode(&bytes).expect("decode");
        assert_eq!(decoded, snapshot);
        assert_eq!(
            decoded.versions("left-pad").unwrap()[0].version,
            "1.0.0"
        );
    }

    #[test]
    fn test_insertion_order_does_not_affect_bytes() {
        let mut a = Snapshot::new();
        a.insert_package("zlib", vec![entry("1.3", "u1")]);
        a.insert_package("attrs", vec![entry("23.1", "u2")]);

        let mut b = Snapshot::new();
        b.insert_package("attrs", vec![entry("23.1", "u2")]);
        b.insert_package("zlib", vec![entry("1.3", "u1")]);

        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn test_version_order_preserved() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_package(
            "pkg",
            vec![entry("1.0.0", "a"), entry("1.1.0", "b"), entry("2.0.0", "c")],
        );
        let decoded = Snapshot::decode(&snapshot.encode().unwrap()).unwrap();
        let versions: Vec<&str> = decoded
            .versions("pkg")
            .unwrap()
            .iter()
            .map(|v| v.version.as_str())
            .collect();
        assert_eq!(versions, ["1.0.0", "1.1.0", "2.0.0"]);
    }

    #[test]
    fn test_included_versions_lists_every_pair() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_package("a", vec![entry("1", "u"), entry("2", "u")]);
        snapshot.insert_package("b", vec![entry("1", "u")]);
        let included = snapshot.included_versions();
        assert_eq!(included.len(), 3);
        assert!(included.contains(&("a".to_string(), "2".to_string())));
        assert!(included.contains(&("b".to_string(), "1".to_string())));
    }

    #[test]
    fn test_version_rows_map_exactly_onto_included_pairs() {
        use crate::db::models::PackageVersion;

        fn row(package_id: &str, version: &str, published: bool) -> PackageVersion {
            PackageVersion {
                package_id: package_id.to_string(),
                version: version.to_string(),
                url: format!("https://cdn.example.com/{package_id}-{version}"),
                published,
            }
        }

        // Mixed publication states: the commit step publishes precisely the
        // pairs the snapshot carries, so the mapping must be one-to-one.
        let mut grouped = BTreeMap::new();
        grouped.insert(
            "attrs".to_string(),
            vec![row("attrs", "22.1", true), row("attrs", "23.1", false)],
        );
        grouped.insert("zlib".to_string(), vec![row("zlib", "1.3", false)]);

        let snapshot = Snapshot::from_version_rows(grouped);
        let included = snapshot.included_versions();
        assert_eq!(
            included,
            vec![
                ("attrs".to_string(), "22.1".to_string()),
                ("attrs".to_string(), "23.1".to_string()),
                ("zlib".to_string(), "1.3".to_string()),
            ]
        );
        assert_eq!(snapshot.versions("zlib").unwrap()[0].url, "https://cdn.example.com/zlib-1.3");
    }

    #[test]
    fn test_empty_snapshot_encodes() {
        let snapshot = Snapshot::new();
        assert!(snapshot.is_empty());
        let decoded = Snapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded.package_count(), 0);
    }
}
