//! Shared fixtures for rate limiting integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tollgate_ratelimit::*;

/// Shared store stand-in that can be taken down or made to hang.
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
    hang: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            down: AtomicBool::new(false),
            hang: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    async fn gate(&self) -> RateLimitResult<()> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(RateLimitError::store("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn check_and_increment(
        &self,
        bucket: &str,
        plan: &WindowPlan,
    ) -> RateLimitResult<PlanOutcome> {
        self.gate().await?;
        self.inner.check_and_increment(bucket, plan).await
    }

    async fn reset(&self, bucket: &str) -> RateLimitResult<()> {
        self.gate().await?;
        self.inner.reset(bucket).await
    }

    async fn ping(&self) -> RateLimitResult<()> {
        self.gate().await
    }

    fn store_type(&self) -> &'static str {
        "flaky"
    }
}

pub fn user_key(org: &str, user: &str, class: EndpointClass) -> RateLimitKey {
    RateLimitKey::derive(
        &CallerIdentity::new().with_organization(org).with_user(user),
        &class,
    )
    .unwrap()
}

pub fn limits(per_second: u64, per_minute: u64, per_hour: u64, burst: u64) -> RateLimitConfig {
    RateLimitConfig {
        per_second,
        per_minute,
        per_hour,
        burst,
        ..RateLimitConfig::default()
    }
}

pub fn settings(environment: Environment, strategy: MigrationStrategy) -> RateLimitSettings {
    RateLimitSettings::builder()
        .environment(environment)
        .strategy(strategy)
        .build()
        .unwrap()
}
