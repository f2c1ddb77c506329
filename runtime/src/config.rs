//! Engine and sweeper configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use leasehold_core::partition::{DEFAULT_NAMESPACE, PartitionScheme, Partitioner};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Upper bound on a lease, one year.
pub const MAX_LEASE_SECONDS: u64 = 31_536_000;

/// Configuration shared by the transition engine and the expiry sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Key namespace of every batch
    pub namespace: String,
    /// How batch ids map to partition keys (must not change while batches exist)
    pub partition_scheme: PartitionScheme,
    /// Lease duration used when the caller does not pick one, in seconds
    pub default_lease_seconds: u64,
    /// Longest lease a caller may request, in seconds
    pub max_lease_seconds: u64,
    /// Optimistic commit attempts per call before giving up with `Contention`
    pub max_commit_attempts: usize,
    /// Time between sweeper ticks, in milliseconds
    pub sweep_interval_ms: u64,
    /// Lease index entries reclaimed per batch per page
    pub sweep_batch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            partition_scheme: PartitionScheme::BatchTag,
            default_lease_seconds: 30,
            max_lease_seconds: MAX_LEASE_SECONDS,
            max_commit_attempts: 16,
            sweep_interval_ms: 1_000,
            sweep_batch_limit: 500,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `LEASEHOLD_NAMESPACE` | `leasehold` |
    /// | `LEASEHOLD_PARTITION_SCHEME` | `batch` (or `bucketed:<n>`) |
    /// | `LEASEHOLD_LEASE_SECONDS` | `30` |
    /// | `LEASEHOLD_MAX_LEASE_SECONDS` | `31536000` |
    /// | `LEASEHOLD_MAX_COMMIT_ATTEMPTS` | `16` |
    /// | `LEASEHOLD_SWEEP_INTERVAL_MS` | `1000` |
    /// | `LEASEHOLD_SWEEP_BATCH_LIMIT` | `500` |
    ///
    /// Unparseable values fall back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            namespace: lookup("LEASEHOLD_NAMESPACE")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.namespace),
            partition_scheme: lookup("LEASEHOLD_PARTITION_SCHEME")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.partition_scheme),
            default_lease_seconds: lookup("LEASEHOLD_LEASE_SECONDS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.default_lease_seconds),
            max_lease_seconds: lookup("LEASEHOLD_MAX_LEASE_SECONDS")
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs.clamp(1, MAX_LEASE_SECONDS))
                .unwrap_or(defaults.max_lease_seconds),
            max_commit_attempts: lookup("LEASEHOLD_MAX_COMMIT_ATTEMPTS")
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_commit_attempts),
            sweep_interval_ms: lookup("LEASEHOLD_SWEEP_INTERVAL_MS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.sweep_interval_ms),
            sweep_batch_limit: lookup("LEASEHOLD_SWEEP_BATCH_LIMIT")
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.sweep_batch_limit),
        }
    }

    /// Partitioner for the configured namespace and scheme.
    #[must_use]
    pub fn partitioner(&self) -> Partitioner {
        Partitioner::new(self.namespace.clone(), self.partition_scheme)
    }

    /// Sweeper tick period.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Set the default lease duration.
    #[must_use]
    pub const fn with_default_lease_seconds(mut self, seconds: u64) -> Self {
        self.default_lease_seconds = seconds;
        self
    }

    /// Set the commit attempt bound. At least one attempt is always made.
    #[must_use]
    pub const fn with_max_commit_attempts(mut self, attempts: usize) -> Self {
        self.max_commit_attempts = if attempts == 0 { 1 } else { attempts };
        self
    }

    /// Set the sweeper tick period.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the sweeper page size.
    #[must_use]
    pub const fn with_sweep_batch_limit(mut self, limit: usize) -> Self {
        self.sweep_batch_limit = if limit == 0 { 1 } else { limit };
        self
    }

    /// Set the partition scheme.
    #[must_use]
    pub const fn with_partition_scheme(mut self, scheme: PartitionScheme) -> Self {
        self.partition_scheme = scheme;
        self
    }
}
