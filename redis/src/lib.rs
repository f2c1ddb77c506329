//! # Leasehold Redis
//!
//! Redis implementation of the [`TicketStore`](leasehold_core::TicketStore) contract.
//!
//! Each batch's status sets, catalog, leases and lease index share one Redis
//! Cluster hash tag, so every engine commit is a single Lua script on a single
//! slot. See [`store`] for the key layout.
//!
//! ## Example
//!
//! ```no_run
//! use leasehold_core::environment::SystemClock;
//! use leasehold_redis::{RedisConfig, RedisTicketStore};
//! use leasehold_runtime::{EngineConfig, TransitionEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine_config = EngineConfig::from_env();
//! let redis_config = RedisConfig::from_env();
//!
//! let store = RedisTicketStore::new(&redis_config.url, &engine_config.partitioner()).await?;
//! let engine = TransitionEngine::new(Arc::new(store), Arc::new(SystemClock), engine_config);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod store;

pub use config::RedisConfig;
pub use store::RedisTicketStore;
