//! Pooled Redis access.

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    RedisConfig, Result,
    monitor::HealthProbe,
    pool::{RedisConnection, RedisPool, RedisPoolBuilder},
};

/// Redis service owning the connection pool.
pub struct RedisService {
    config: RedisConfig,
    pool: RedisPool,
}

impl RedisService {
    /// Connect and build the pool.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = RedisPoolBuilder::new(config.clone()).build().await?;
        Ok(Self { config, pool })
    }

    /// Build the pool without requiring the store to be up yet.
    pub async fn lazy(config: RedisConfig) -> Result<Self> {
        let pool = RedisPoolBuilder::new(config.clone())
            .verify_on_start(false)
            .build()
            .await?;
        Ok(Self { config, pool })
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Get a connection from the pool.
    pub async fn get(&self) -> Result<RedisConnection<'_>> {
        Ok(self.pool.get().await?.into())
    }

    /// PING through a pooled connection.
    pub async fn health_check(&self) -> Result<()> {
        crate::pool::ping(&self.pool).await
    }

    /// Get pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
            max_size: self.config.pool_size,
        }
    }
}

#[async_trait]
impl HealthProbe for RedisService {
    async fn probe(&self) -> Result<PoolStats> {
        self.health_check().await?;
        Ok(self.pool_stats())
    }
}

impl std::fmt::Debug for RedisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisService")
            .field("url", &self.config.redacted_url())
            .field("pool", &self.pool_stats())
            .finish()
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total connections currently open.
    pub connections: u32,
    /// Idle connections available for checkout.
    pub idle_connections: u32,
    /// Configured maximum.
    pub max_size: u32,
}

impl PoolStats {
    /// Every connection is open and none is idle.
    pub fn is_exhausted(&self) -> bool {
        self.max_size > 0 && self.connections >= self.max_size && self.idle_connections == 0
    }
}
