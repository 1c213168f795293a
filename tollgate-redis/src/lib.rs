//! # Tollgate Redis
//!
//! Pooled access to the Redis instance that holds shared rate limit counters.
//!
//! ## Features
//!
//! - **Connection Pooling**: bb8 pool verified with a PING at startup
//! - **Health Monitoring**: [`PoolMonitor`] probes the store on its own
//!   schedule, independent of request traffic
//! - **Environment Config**: [`RedisConfig::from_env`] reads `REDIS_*` variables
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tollgate_redis::{PoolMonitor, RedisConfig, RedisService};
//!
//! let config = RedisConfig::from_env().pool_size(32).build();
//! let redis = Arc::new(RedisService::new(config.clone()).await?);
//!
//! let monitor = PoolMonitor::spawn(
//!     redis.clone(),
//!     config.health_check_interval,
//!     Duration::from_millis(500),
//! );
//! assert!(monitor.health().is_reachable());
//! ```

mod config;
mod error;
mod monitor;
mod pool;
mod service;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use monitor::{HealthProbe, HealthSnapshot, PoolHealth, PoolMonitor};
pub use pool::{RedisConnection, RedisPool, RedisPoolBuilder};
pub use service::{PoolStats, RedisService};

// Re-export redis crate for script invocation
pub use redis;
