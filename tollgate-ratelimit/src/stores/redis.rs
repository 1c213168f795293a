//! Redis counter store
//!
//! Shared counters for distributed rate limiting across instances. A single
//! Lua script reads every window counter of a bucket, decides, and commits
//! the increments server-side, so concurrent callers cannot interleave
//! between check and increment. All counters of a bucket carry the hash tag
//! `{bucket}` and therefore live in one Redis Cluster slot.
//!
//! Requires the `redis` feature to be enabled.

use crate::config::RateLimitSettings;
use crate::error::{RateLimitError, RateLimitResult};
use crate::stores::{CounterStore, PlanOutcome};
use crate::window::{CounterState, Window, WindowPlan};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tollgate_redis::redis::{self, Script};
use tollgate_redis::{RedisConfig, RedisService};
use tracing::{debug, trace};

/// Mirrors `WindowPlan::decide`.
///
/// KEYS[i]: counter of window i.
/// ARGV[3i-2], ARGV[3i-1], ARGV[3i]: limit, ttl in ms, mode
/// (0 hard, 1 overflow, 2 credit).
/// Returns {denied_index, count_1, pttl_1, ..., count_n, pttl_n}.
const CHECK_AND_INCREMENT: &str = r#"
local n = #KEYS
local counts = {}
local has_credit = false
for i = 1, n do
    counts[i] = tonumber(redis.call('GET', KEYS[i]) or '0')
    if tonumber(ARGV[3 * i]) == 2 then
        has_credit = true
    end
end

local denied = 0
local overflow = false
local inc = {}
for i = 1, n do
    local limit = tonumber(ARGV[3 * i - 2])
    local mode = tonumber(ARGV[3 * i])
    if mode == 0 then
        if counts[i] >= limit then
            denied = i
            break
        end
        inc[i] = true
    elseif mode == 1 then
        if counts[i] < limit then
            inc[i] = true
        elseif has_credit then
            overflow = true
        else
            denied = i
            break
        end
    elseif overflow then
        if counts[i] >= limit then
            denied = i
            break
        end
        inc[i] = true
    end
end

local result = {denied}
for i = 1, n do
    local count = counts[i]
    local ttl_ms = ARGV[3 * i - 1]
    if denied == 0 and inc[i] then
        count = redis.call('INCR', KEYS[i])
        if count == 1 then
            redis.call('PEXPIRE', KEYS[i], ttl_ms)
        end
    end
    local pttl = redis.call('PTTL', KEYS[i])
    if count > 0 and pttl == -1 then
        redis.call('PEXPIRE', KEYS[i], ttl_ms)
        pttl = tonumber(ttl_ms)
    end
    result[#result + 1] = count
    result[#result + 1] = pttl
end
return result
"#;

/// Redis-backed counter store
pub struct RedisStore {
    redis: Arc<RedisService>,
    prefix: String,
    script: Script,
}

impl RedisStore {
    /// Create a store on an existing pool
    pub fn new(redis: Arc<RedisService>, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            script: Script::new(CHECK_AND_INCREMENT),
        }
    }

    /// Store namespaced by the settings' `key_prefix`
    ///
    /// The prefix is fixed for the lifetime of the store; a reload that
    /// changes `key_prefix` takes effect once the store is rebuilt.
    pub fn for_settings(redis: Arc<RedisService>, settings: &RateLimitSettings) -> Self {
        Self::new(redis, settings.key_prefix.clone())
    }

    /// Connect and create a store namespaced by the settings' `key_prefix`
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be built or the first PING fails.
    pub async fn connect(config: RedisConfig, settings: &RateLimitSettings) -> RateLimitResult<Self> {
        debug!(
            url = %config.redacted_url(),
            prefix = %settings.key_prefix,
            "Connecting to Redis for rate limiting"
        );
        let service = RedisService::new(config).await?;
        Ok(Self::for_settings(Arc::new(service), settings))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn service(&self) -> &Arc<RedisService> {
        &self.redis
    }

    /// Full key of one window counter
    fn counter_key(&self, bucket: &str, window: Window) -> String {
        format!("{}:{{{}}}:{}", self.prefix, bucket, window.key_suffix())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn check_and_increment(
        &self,
        bucket: &str,
        plan: &WindowPlan,
    ) -> RateLimitResult<PlanOutcome> {
        trace!(bucket = %bucket, windows = plan.specs().len(), "Redis check and increment");

        let mut invocation = self.script.prepare_invoke();
        for spec in plan.specs() {
            invocation
                .key(self.counter_key(bucket, spec.window))
                .arg(spec.limit)
                .arg(spec.ttl.as_millis().max(1) as u64)
                .arg(spec.mode.code());
        }

        let mut conn = self.redis.get().await?;
        let raw: Vec<i64> = invocation.invoke_async(&mut *conn).await?;

        parse_outcome(plan, &raw)
    }

    async fn reset(&self, bucket: &str) -> RateLimitResult<()> {
        let keys: Vec<String> = Window::PRIORITY
            .iter()
            .map(|w| self.counter_key(bucket, *w))
            .collect();

        let mut conn = self.redis.get().await?;
        let _: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut *conn).await?;
        Ok(())
    }

    async fn ping(&self) -> RateLimitResult<()> {
        self.redis.health_check().await?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}

fn parse_outcome(plan: &WindowPlan, raw: &[i64]) -> RateLimitResult<PlanOutcome> {
    let specs = plan.specs();
    if raw.len() != 1 + 2 * specs.len() {
        return Err(RateLimitError::store(format!(
            "unexpected script reply of {} values for {} windows",
            raw.len(),
            specs.len()
        )));
    }

    let denied_by = match raw[0] {
        0 => None,
        index => {
            let spec = usize::try_from(index - 1)
                .ok()
                .and_then(|i| specs.get(i))
                .ok_or_else(|| {
                    RateLimitError::store(format!("script denied unknown window {}", index))
                })?;
            Some(spec.window)
        }
    };

    let counters = raw[1..]
        .chunks_exact(2)
        .map(|pair| CounterState {
            count: pair[0].max(0).unsigned_abs(),
            ttl: (pair[1] > 0).then(|| Duration::from_millis(pair[1].unsigned_abs())),
        })
        .collect();

    Ok(PlanOutcome {
        denied_by,
        counters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn plan() -> WindowPlan {
        WindowPlan::from_config(&RateLimitConfig::default())
    }

    #[test]
    fn test_parse_admitted_reply() {
        let raw = [0, 3, 900, 3, 59_000, 3, 3_599_000, 0, -2];
        let outcome = parse_outcome(&plan(), &raw).unwrap();

        assert_eq!(outcome.denied_by, None);
        assert_eq!(outcome.counters[0].count, 3);
        assert_eq!(outcome.counters[0].ttl, Some(Duration::from_millis(900)));
        assert_eq!(outcome.counters[3], CounterState::default());
    }

    #[test]
    fn test_parse_denied_reply() {
        let raw = [4, 10, 500, 20, 59_000, 20, 3_599_000, 10, 500];
        let outcome = parse_outcome(&plan(), &raw).unwrap();

        assert_eq!(outcome.denied_by, Some(Window::Burst));
    }

    #[test]
    fn test_parse_rejects_malformed_reply() {
        assert!(parse_outcome(&plan(), &[0, 1, 2]).is_err());
        assert!(parse_outcome(&plan(), &[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_counter_keys_use_configured_prefix() {
        let settings = RateLimitSettings::builder()
            .key_prefix("acme-limits")
            .build()
            .unwrap();
        let mut config = RedisConfig::new("redis://127.0.0.1:6399");
        config.min_idle = None;
        let service = RedisService::lazy(config).await.unwrap();

        let store = RedisStore::for_settings(Arc::new(service), &settings);

        assert_eq!(store.prefix(), "acme-limits");
        assert_eq!(
            store.counter_key("org:a:user:b:api", Window::Minute),
            "acme-limits:{org:a:user:b:api}:m"
        );
        assert_eq!(
            store.counter_key("anon:api", Window::Burst),
            "acme-limits:{anon:api}:b"
        );
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_store_counts() {
        let config = RedisConfig::new("redis://localhost:6379");
        let settings = RateLimitSettings::builder()
            .key_prefix("tollgate-test")
            .build()
            .unwrap();
        let store = RedisStore::connect(config, &settings).await.unwrap();
        let plan = WindowPlan::from_config(&RateLimitConfig {
            per_second: 2,
            burst: 2,
            ..RateLimitConfig::default()
        });

        store.reset("redis-store-counts").await.unwrap();
        for _ in 0..2 {
            let outcome = store
                .check_and_increment("redis-store-counts", &plan)
                .await
                .unwrap();
            assert_eq!(outcome.denied_by, None);
        }

        let denied = store
            .check_and_increment("redis-store-counts", &plan)
            .await
            .unwrap();
        assert_eq!(denied.denied_by, Some(Window::Second));
        assert_eq!(denied.counters[1].count, 2);
    }
}
