//! Deterministic package-to-shard assignment.
//!
//! Every process that needs to know which shard a package lives on computes
//! it locally from the package identifier; there is no assignment table and
//! no coordinator. The function must therefore be stable across processes
//! and over time for a fixed `(package_id, shard_count)` pair.

use sha2::{Digest, Sha256};

/// Map a package identifier onto a shard index in `0..shard_count`.
///
/// Takes the SHA-256 digest of the identifier, interprets the first 16 bytes
/// as a big-endian `u128`, and reduces it modulo `shard_count`. A package's
/// shard is fixed forever at creation; changing `shard_count` after packages
/// exist invalidates all prior assignments and is not supported.
pub fn shard_for_package(package_id: &str, shard_count: u32) -> u32 {
    debug_assert!(shard_count > 0, "shard_count must be positive");
    let digest = Sha256::digest(package_id.as_bytes());
    let mut prefix = [0u8; 16];
    prefix.copy_from_slice(&digest[..16]);
    (u128::from_be_bytes(prefix) % u128::from(shard_count)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    // Digest prefixes verified against an independent SHA-256 implementation:
    //   sha256("left-pad")[..16] = 0cc8ed26e04976bca87d2617e4c0c481
    //   sha256("requests")[..16] = ec72420df5dfbdce4111f715c96338df
    //   sha256("numpy")[..16]    = 73dd0baf8e5438da8816254a073ee43b
    #[test]
    fn test_known_assignments() {
        assert_eq!(shard_for_package("left-pad", 4), 1);
        assert_eq!(shard_for_package("left-pad", 16), 1);
        assert_eq!(shard_for_package("requests", 4), 3);
        assert_eq!(shard_for_package("requests", 16), 15);
        assert_eq!(shard_for_package("numpy", 16), 11);
    }

    #[test]
    fn test_deterministic_across_calls() {
        for id in ["a", "left-pad", "some-very-long-package-name", "π"] {
            let first = shard_for_package(id, 64);
            for _ in 0..100 {
                assert_eq!(shard_for_package(id, 64), first);
            }
        }
    }

    #[test]
    fn test_always_in_range() {
        for i in 0..1000 {
            let id = format!("pkg-{i}");
            for count in [1, 2, 3, 4, 7, 16, 255] {
                assert!(shard_for_package(&id, count) < count);
            }
        }
    }

    #[test]
    fn test_single_shard_collapses_to_zero() {
        assert_eq!(shard_for_package("anything", 1), 0);
    }
}
