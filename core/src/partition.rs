//! Colocation partitioner.
//!
//! Every record touched by one atomic transition must live on one storage shard.
//! The partitioner maps a [`BatchId`] to a [`PartitionKey`]; all keys derived from
//! that partition key carry the same Redis Cluster hash tag (`{...}`) and therefore
//! hash to the same cluster slot.
//!
//! The mapping is a pure function of the batch id and the configured scheme. It must
//! stay stable for the lifetime of a batch: changing the scheme of a running
//! deployment would orphan every provisioned batch.
//!
//! # Schemes
//!
//! - [`PartitionScheme::BatchTag`]: the batch id itself is the hash tag. One batch
//!   per tag; batches spread over the cluster as evenly as their ids hash.
//! - [`PartitionScheme::Bucketed`]: the batch id is hashed (SHA-256) into a fixed
//!   number of buckets and the bucket is the hash tag. Useful to pin many small
//!   batches onto a bounded set of slots.

use crate::types::BatchId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use thiserror::Error;

/// Number of hash slots in a Redis Cluster.
pub const CLUSTER_SLOTS: u16 = 16_384;

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "leasehold";

/// How batch ids are turned into hash tags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionScheme {
    /// Use the batch id as the hash tag.
    #[default]
    BatchTag,
    /// Hash the batch id into one of `buckets` tags.
    Bucketed {
        /// Number of buckets
        buckets: NonZeroU32,
    },
}

/// Error parsing a [`PartitionScheme`] from configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid partition scheme '{0}' (expected 'batch' or 'bucketed:<n>' with n > 0)")]
pub struct ParsePartitionSchemeError(String);

impl FromStr for PartitionScheme {
    type Err = ParsePartitionSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("batch") {
            return Ok(Self::BatchTag);
        }

        trimmed
            .strip_prefix("bucketed:")
            .and_then(|n| n.parse::<u32>().ok())
            .and_then(NonZeroU32::new)
            .map(|buckets| Self::Bucketed { buckets })
            .ok_or_else(|| ParsePartitionSchemeError(s.to_string()))
    }
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchTag => f.write_str("batch"),
            Self::Bucketed { buckets } => write!(f, "bucketed:{buckets}"),
        }
    }
}

/// Storage location of one batch.
///
/// Build keys for the batch's records with [`PartitionKey::key`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    batch_id: BatchId,
    tag: String,
    prefix: String,
}

impl PartitionKey {
    /// The batch this key belongs to.
    #[must_use]
    pub const fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    /// The hash tag shared by every key of the batch (without braces).
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Full key for one record family of the batch, e.g. `leasehold:{90}:available`.
    #[must_use]
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.prefix)
    }

    /// Cluster slot every key of this batch hashes to.
    #[must_use]
    pub fn slot(&self) -> u16 {
        crc16(self.tag.as_bytes()) % CLUSTER_SLOTS
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

/// Maps batch ids to partition keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partitioner {
    namespace: String,
    scheme: PartitionScheme,
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, PartitionScheme::BatchTag)
    }
}

impl Partitioner {
    /// Create a partitioner for `namespace` using `scheme`.
    #[must_use]
    pub fn new(namespace: impl Into<String>, scheme: PartitionScheme) -> Self {
        Self {
            namespace: namespace.into(),
            scheme,
        }
    }

    /// Key namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Configured scheme.
    #[must_use]
    pub const fn scheme(&self) -> PartitionScheme {
        self.scheme
    }

    /// Key of the global batch registry.
    ///
    /// The registry deliberately lives outside every batch slot; it is only
    /// written with single-key commands.
    #[must_use]
    pub fn registry_key(&self) -> String {
        format!("{}:batches", self.namespace)
    }

    /// Derive the partition key of `batch_id`.
    #[must_use]
    pub fn partition_key(&self, batch_id: &BatchId) -> PartitionKey {
        match self.scheme {
            PartitionScheme::BatchTag => PartitionKey {
                batch_id: batch_id.clone(),
                tag: batch_id.as_str().to_string(),
                prefix: format!("{}:{{{}}}", self.namespace, batch_id),
            },
            PartitionScheme::Bucketed { buckets } => {
                let tag = format!("b{}", bucket_of(batch_id, buckets));
                PartitionKey {
                    batch_id: batch_id.clone(),
                    prefix: format!("{}:{{{tag}}}:{batch_id}", self.namespace),
                    tag,
                }
            }
        }
    }
}

fn bucket_of(batch_id: &BatchId, buckets: NonZeroU32) -> u32 {
    let digest = Sha256::digest(batch_id.as_str().as_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head % buckets.get()
}

/// Cluster slot of an arbitrary key, honouring `{hash tag}` sections.
#[must_use]
pub fn key_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = key
        .find('{')
        .and_then(|open| {
            key[open + 1..]
                .find('}')
                .filter(|len| *len > 0)
                .map(|len| &bytes[open + 1..open + 1 + len])
        })
        .unwrap_or(bytes);
    crc16(hashed) % CLUSTER_SLOTS
}

/// CRC16-XMODEM, as used by Redis Cluster key hashing.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            };
        }
    }
    crc
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn batch_tag_layout() {
        let key = Partitioner::default().partition_key(&BatchId::new("75"));
        assert_eq!(key.key("reserved"), "leasehold:{75}:reserved");
        assert_eq!(key.key("lease_exp"), "leasehold:{75}:lease_exp");
        assert_eq!(key.tag(), "75");
    }

    #[test]
    fn bucketed_keys_stay_distinct_per_batch() {
        let buckets = NonZeroU32::new(1).unwrap();
        let partitioner = Partitioner::new("ns", PartitionScheme::Bucketed { buckets });
        let a = partitioner.partition_key(&BatchId::new("a"));
        let b = partitioner.partition_key(&BatchId::new("b"));

        assert_eq!(a.tag(), "b0");
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a.key("available"), b.key("available"));
    }

    #[test]
    fn parse_schemes() {
        assert_eq!("batch".parse::<PartitionScheme>(), Ok(PartitionScheme::BatchTag));
        assert_eq!(
            "bucketed:64".parse::<PartitionScheme>(),
            Ok(PartitionScheme::Bucketed { buckets: NonZeroU32::new(64).unwrap() })
        );
        assert!("bucketed:0".parse::<PartitionScheme>().is_err());
        assert!("ring".parse::<PartitionScheme>().is_err());
    }

    #[test]
    fn scheme_display_round_trips() {
        let scheme = PartitionScheme::Bucketed { buckets: NonZeroU32::new(8).unwrap() };
        assert_eq!(scheme.to_string().parse::<PartitionScheme>(), Ok(scheme));
    }

    #[test]
    fn empty_hash_tag_hashes_whole_key() {
        assert_eq!(key_slot("foo{}bar"), crc16(b"foo{}bar") % CLUSTER_SLOTS);
    }

    proptest! {
        #[test]
        fn every_batch_key_shares_the_partition_slot(batch in "[a-z0-9-]{1,24}", buckets in 1u32..512) {
            let schemes = [
                PartitionScheme::BatchTag,
                PartitionScheme::Bucketed { buckets: NonZeroU32::new(buckets).unwrap() },
            ];
            for scheme in schemes {
                let partitioner = Partitioner::new(DEFAULT_NAMESPACE, scheme);
                let key = partitioner.partition_key(&BatchId::new(batch.clone()));
                for suffix in ["available", "reserved", "sold", "tickets", "leases", "lease_exp"] {
                    prop_assert_eq!(key_slot(&key.key(suffix)), key.slot());
                }
            }
        }

        #[test]
        fn partitioning_is_stable(batch in "[ -~]{1,32}") {
            let scheme = PartitionScheme::Bucketed { buckets: NonZeroU32::new(32).unwrap() };
            let first = Partitioner::new("x", scheme).partition_key(&BatchId::new(batch.clone()));
            let second = Partitioner::new("x", scheme).partition_key(&BatchId::new(batch));
            prop_assert_eq!(first, second);
        }
    }
}
