//! bb8 pool over multiplexed Redis connections.
//!
//! Startup can either insist on a reachable store (`verify_on_start`, the
//! default) or come up lazily so a fail-closed service can start during an
//! outage and begin admitting once the store answers.

use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::aio::MultiplexedConnection;
use std::ops::{Deref, DerefMut};
use tracing::{info, warn};

use crate::{RedisConfig, RedisError, Result};

pub type RedisPool = Pool<RedisConnectionManager>;

/// Connection checked out of the pool; returned on drop.
pub struct RedisConnection<'a>(PooledConnection<'a, RedisConnectionManager>);

impl<'a> From<PooledConnection<'a, RedisConnectionManager>> for RedisConnection<'a> {
    fn from(conn: PooledConnection<'a, RedisConnectionManager>) -> Self {
        Self(conn)
    }
}

impl Deref for RedisConnection<'_> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RedisConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub struct RedisPoolBuilder {
    config: RedisConfig,
    verify_on_start: bool,
}

impl RedisPoolBuilder {
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            verify_on_start: true,
        }
    }

    /// Fail `build` unless the store answers a PING.
    pub fn verify_on_start(mut self, verify: bool) -> Self {
        self.verify_on_start = verify;
        self
    }

    pub async fn build(self) -> Result<RedisPool> {
        let manager = RedisConnectionManager::new(self.config.connection_url())
            .map_err(|e| RedisError::Config(e.to_string()))?;

        let builder = Pool::builder()
            .max_size(self.config.pool_size)
            .min_idle(self.config.min_idle)
            .connection_timeout(self.config.connection_timeout)
            .test_on_check_out(false);

        let pool = if self.verify_on_start {
            let pool = builder
                .build(manager)
                .await
                .map_err(|e| RedisError::Connection(e.to_string()))?;
            ping(&pool).await?;
            pool
        } else {
            builder.build_unchecked(manager)
        };

        if self.verify_on_start {
            info!(
                pool_size = self.config.pool_size,
                url = %self.config.redacted_url(),
                "Redis pool ready"
            );
        } else {
            warn!(
                pool_size = self.config.pool_size,
                url = %self.config.redacted_url(),
                "Redis pool created without verifying the store"
            );
        }

        Ok(pool)
    }
}

pub(crate) async fn ping(pool: &RedisPool) -> Result<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| RedisError::Connection(e.to_string()))?;
    Ok(())
}
