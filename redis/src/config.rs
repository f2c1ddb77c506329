//! Redis connection and sweeper process configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;

/// Where the backing store lives and where the sweeper exposes metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prometheus scrape address of the sweeper process
    pub metrics_addr: SocketAddr,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl RedisConfig {
    /// Load configuration from environment variables.
    ///
    /// - `REDIS_URL` (default `redis://127.0.0.1:6379`)
    /// - `LEASEHOLD_METRICS_ADDR` (default `0.0.0.0:9090`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            url: lookup("REDIS_URL")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.url),
            metrics_addr: lookup("LEASEHOLD_METRICS_ADDR")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.metrics_addr),
        }
    }
}
