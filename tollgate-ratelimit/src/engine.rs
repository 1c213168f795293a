//! Rate limit engine
//!
//! Turns a key and a config into a decision by running one atomic
//! check-and-increment against a [`CounterStore`]. The engine never applies
//! the outage policy itself: an unreachable or slow store surfaces as
//! [`RateLimitError::BackendUnavailable`], and the caller decides whether to
//! fail open or closed.

use crate::config::RateLimitConfig;
use crate::decision::{Backend, RateLimitDecision, ceil_secs, unix_now};
use crate::error::{RateLimitError, RateLimitResult};
use crate::key::RateLimitKey;
use crate::stores::{CounterStore, MemoryStore, PlanOutcome};
use crate::window::{Window, WindowMode, WindowPlan};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Default store round-trip timeout
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Anything that can decide on a request.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Evaluate one request against its bucket
    async fn evaluate(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
    ) -> RateLimitResult<RateLimitDecision>;

    /// Backend whose decisions this limiter returns
    fn backend(&self) -> Backend;

    /// Check that the enforcing backend is reachable
    async fn ping(&self) -> RateLimitResult<()>;
}

/// Multi-window limiter over a counter store
pub struct RateLimitEngine {
    store: Arc<dyn CounterStore>,
    backend: Backend,
    timeout: Duration,
}

impl RateLimitEngine {
    pub fn new(store: Arc<dyn CounterStore>, backend: Backend, timeout: Duration) -> Self {
        debug!(
            store = store.store_type(),
            backend = %backend,
            timeout = ?timeout,
            "Creating rate limit engine"
        );
        Self {
            store,
            backend,
            timeout,
        }
    }

    /// Engine over the shared store
    pub fn distributed(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self::new(store, Backend::Distributed, timeout)
    }

    /// Engine over process-local counters
    pub fn legacy() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Backend::Legacy,
            DEFAULT_STORE_TIMEOUT,
        )
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drop every counter of a key
    pub async fn reset(&self, key: &RateLimitKey) -> RateLimitResult<()> {
        debug!(key = %key, "Resetting rate limit");
        self.store.reset(key.as_str()).await
    }
}

impl std::fmt::Debug for RateLimitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitEngine")
            .field("store", &self.store.store_type())
            .field("backend", &self.backend)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl Limiter for RateLimitEngine {
    async fn evaluate(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
    ) -> RateLimitResult<RateLimitDecision> {
        trace!(key = %key, backend = %self.backend, "Checking rate limit");

        let plan = WindowPlan::from_config(config);
        let call = self.store.check_and_increment(key.as_str(), &plan);

        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                return Err(RateLimitError::unavailable(format!(
                    "{} store: {}",
                    self.store.store_type(),
                    err
                )));
            }
            Err(_) => {
                return Err(RateLimitError::unavailable(format!(
                    "{} store timed out after {:?}",
                    self.store.store_type(),
                    self.timeout
                )));
            }
        };

        let decision = build_decision(&plan, &outcome, config, self.backend, unix_now());

        if decision.allowed {
            debug!(
                key = %key,
                backend = %self.backend,
                remaining = decision.remaining,
                "Request allowed"
            );
        } else {
            info!(
                key = %key,
                backend = %self.backend,
                window = ?decision.limit_type,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    async fn ping(&self) -> RateLimitResult<()> {
        match tokio::time::timeout(self.timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::unavailable(format!(
                "{} store ping timed out",
                self.store.store_type()
            ))),
        }
    }
}

/// Translate counter state into a decision.
///
/// Denials report the denying window; admissions report the window with the
/// least remaining quota (earliest in priority order on ties). The second
/// window's remaining quota includes unused burst credit.
fn build_decision(
    plan: &WindowPlan,
    outcome: &PlanOutcome,
    config: &RateLimitConfig,
    backend: Backend,
    now: u64,
) -> RateLimitDecision {
    let specs = plan.specs();
    let count = |i: usize| outcome.counters.get(i).map_or(0, |c| c.count);
    let ttl = |i: usize| {
        outcome
            .counters
            .get(i)
            .and_then(|c| c.ttl)
            .unwrap_or(specs[i].ttl)
    };

    if let Some(window) = outcome.denied_by {
        let retry_after = match (window, plan.position(Window::Second), plan.position(window)) {
            (Window::Burst, Some(second), Some(burst)) => ttl(second).min(ttl(burst)),
            (_, _, Some(i)) => ttl(i),
            _ => Duration::from_secs(1),
        };
        return RateLimitDecision::denied(
            config.ceiling(window),
            now + ceil_secs(retry_after),
            retry_after,
            window,
            backend,
        );
    }

    let credit_left = plan
        .position(Window::Burst)
        .map_or(0, |i| specs[i].limit.saturating_sub(count(i)));

    let mut tightest: Option<(Window, u64, Duration)> = None;
    for (i, spec) in specs.iter().enumerate() {
        let remaining = match spec.mode {
            WindowMode::Credit => continue,
            WindowMode::Overflow => spec.limit.saturating_sub(count(i)) + credit_left,
            WindowMode::Hard => spec.limit.saturating_sub(count(i)),
        };
        if tightest.is_none_or(|(_, least, _)| remaining < least) {
            tightest = Some((spec.window, remaining, ttl(i)));
        }
    }

    let (window, remaining, reset_in) =
        tightest.unwrap_or((Window::Second, config.burst, Duration::from_secs(1)));

    RateLimitDecision::allowed(
        remaining,
        config.ceiling(window),
        now + ceil_secs(reset_in),
        window,
        backend,
    )
}
