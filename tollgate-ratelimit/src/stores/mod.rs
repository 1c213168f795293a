//! Counter storage backends
//!
//! - **Memory**: in-process counters using DashMap (legacy engine, tests)
//! - **Redis**: shared counters for multi-instance deployments, evaluated
//!   atomically by a server-side script

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

use crate::error::RateLimitResult;
use crate::window::{CounterState, Window, WindowPlan};
use async_trait::async_trait;

/// What a store observed and did for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    /// First window that denied, if any. Nothing was written on denial.
    pub denied_by: Option<Window>,
    /// Counters after the operation, aligned with the plan's specs
    pub counters: Vec<CounterState>,
}

/// Trait for counter storage backends
///
/// `check_and_increment` must be atomic per bucket: concurrent callers for
/// the same bucket never observe the same pre-increment value.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Apply [`WindowPlan::decide`] to the bucket's counters and commit the
    /// increments as one indivisible operation
    async fn check_and_increment(
        &self,
        bucket: &str,
        plan: &WindowPlan,
    ) -> RateLimitResult<PlanOutcome>;

    /// Drop every counter of a bucket
    async fn reset(&self, bucket: &str) -> RateLimitResult<()>;

    /// Check that the store is reachable
    async fn ping(&self) -> RateLimitResult<()>;

    /// Get store type name for debugging
    fn store_type(&self) -> &'static str;
}
