//! Pinned partition-key function
//!
//! Every process that reads or writes `partition_key` must compute it
//! bit-for-bit identically, including the store itself. The algorithm is:
//!
//! 1. hash the UTF-8 bytes of the link with SHA-256;
//! 2. read the first four digest bytes as a big-endian `u32`;
//! 3. reduce modulo the partition count.
//!
//! The SQL twin lives in the `zen_partition_key(text, int)` migration:
//!
//! ```sql
//! ('x' || lpad(substr(encode(sha256(convert_to(link, 'UTF8')), 'hex'), 1, 8), 16, '0'))
//!     ::bit(64)::bigint % partitions
//! ```
//!
//! Do not replace this with `std::hash::Hash`: its output is not stable across
//! builds, platforms or languages.

use sha2::{Digest, Sha256};

use crate::error::{Result, ZenError};

/// Number of shards `partition_key` maps into.
pub const PARTITION_COUNT: u32 = 32;

/// Name of the store-side function implementing the same algorithm.
pub const SQL_FUNCTION: &str = "zen_partition_key";

/// Links evaluated on both sides of the wire during the startup parity check.
/// Includes non-ASCII input so encoding differences show up.
pub const PROBE_LINKS: &[&str] = &[
    "https://a.com",
    "https://example.org/",
    "https://www.google.com/maps/place/Cafe+Luna",
    "https://müller-bäckerei.de/kontakt",
    "http://x",
];

/// 32-bit prefix of SHA-256 over the link's UTF-8 bytes.
pub fn link_hash(link: &str) -> u32 {
    let digest = Sha256::digest(link.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Partition key for `link` with the fleet-wide [`PARTITION_COUNT`].
///
/// Callers reject empty links before getting here.
pub fn partition_key(link: &str) -> i32 {
    partition_key_with(link, PARTITION_COUNT)
}

/// Partition key for `link` over `partitions` shards. Zero is treated as one
/// shard; counts are clamped to `i32::MAX` so the key fits the column type.
pub fn partition_key_with(link: &str, partitions: u32) -> i32 {
    let partitions = partitions.clamp(1, i32::MAX as u32);
    (link_hash(link) % partitions) as i32
}

/// Checks a key obtained elsewhere (a stored row, another process) against the
/// pinned function.
pub fn verify(link: &str, actual: i32) -> Result<()> {
    let expected = partition_key(link);
    if expected == actual {
        Ok(())
    } else {
        Err(ZenError::PartitionKeyMismatch {
            link: link.to_string(),
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Reference values computed independently from the SHA-256 digests.
    #[test]
    fn test_known_vectors() {
        assert_eq!(link_hash("https://a.com"), 0x4b59_642f);
        assert_eq!(partition_key("https://a.com"), 15);
        assert_eq!(partition_key("https://example.org/"), 26);
        assert_eq!(partition_key("https://www.google.com/maps/place/Cafe+Luna"), 21);
        assert_eq!(partition_key(""), 2);
    }

    #[test]
    fn test_other_partition_counts() {
        assert_eq!(partition_key_with("https://a.com", 64), 47);
        assert_eq!(partition_key_with("https://example.org/", 64), 58);
        assert_eq!(partition_key_with("https://a.com", 1), 0);
        assert_eq!(partition_key_with("https://a.com", 0), 0);
    }

    #[test]
    fn test_verify_reports_mismatch() {
        assert!(verify("https://a.com", 15).is_ok());

        match verify("https://a.com", 7) {
            Err(ZenError::PartitionKeyMismatch { expected, actual, .. }) => {
                assert_eq!(expected, 15);
                assert_eq!(actual, 7);
            },
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_case_and_whitespace_are_significant() {
        // Normalisation happens before hashing, never inside it.
        assert_ne!(link_hash("https://a.com"), link_hash("https://A.com"));
        assert_ne!(link_hash("https://a.com"), link_hash("https://a.com "));
    }

    proptest! {
        #[test]
        fn prop_key_in_range(link in ".{0,200}", partitions in 1u32..4096) {
            let key = partition_key_with(&link, partitions);
            prop_assert!(key >= 0);
            prop_assert!((key as u32) < partitions);
        }

        #[test]
        fn prop_deterministic(link in ".{0,200}") {
            prop_assert_eq!(partition_key(&link), partition_key(&link.clone()));
            prop_assert!(verify(&link, partition_key(&link)).is_ok());
        }
    }
}
