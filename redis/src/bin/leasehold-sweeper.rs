//! Standalone expiry sweeper.
//!
//! Connects to Redis, then returns expired leases of every provisioned batch to
//! the Available set on a fixed interval until Ctrl+C.
//!
//! # Running
//!
//! ```bash
//! REDIS_URL=redis://127.0.0.1:6379 LEASEHOLD_SWEEP_INTERVAL_MS=500 cargo run -p leasehold-redis --bin leasehold-sweeper
//! ```
//!
//! Variables may also come from a `.env` file. Metrics are served on
//! `LEASEHOLD_METRICS_ADDR` (default `0.0.0.0:9090`).

use leasehold_core::environment::SystemClock;
use leasehold_redis::{RedisConfig, RedisTicketStore};
use leasehold_runtime::metrics::MetricsServer;
use leasehold_runtime::{EngineConfig, ExpirySweeper};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,leasehold_runtime=info,leasehold_redis=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine_config = EngineConfig::from_env();
    let redis_config = RedisConfig::from_env();
    tracing::info!(
        namespace = %engine_config.namespace,
        scheme = %engine_config.partition_scheme,
        interval_ms = engine_config.sweep_interval_ms,
        batch_limit = engine_config.sweep_batch_limit,
        "Starting leasehold sweeper"
    );

    let mut metrics = MetricsServer::new(redis_config.metrics_addr);
    metrics.start()?;

    let store = RedisTicketStore::new(&redis_config.url, &engine_config.partitioner()).await?;
    let (sweeper, shutdown) = ExpirySweeper::new(Arc::new(store), Arc::new(SystemClock), &engine_config);
    let handle = sweeper.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping...");

    shutdown.send(true).ok();
    handle.await?;

    tracing::info!("Clean shutdown complete");
    Ok(())
}
