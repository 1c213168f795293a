//! # Tollgate Rate Limiting
//!
//! Distributed rate limiting with fail-closed admission control.
//!
//! ## Features
//!
//! - **Multi-window limits**: per-second, per-minute and per-hour counters
//!   plus burst credit, checked and incremented as one atomic operation
//! - **Storage Backends**: in-memory (DashMap) for the legacy path, Redis
//!   (Lua script, feature `redis`) for the shared counters
//! - **Composite keys**: organization + user, or client IP, per endpoint class
//! - **Migration strategies**: `legacy`, `distributed_only` and `hybrid`,
//!   switched by configuration reload with instant rollback
//! - **Outage policy**: fail-closed by default; fail-open is an explicit
//!   opt-in outside production
//! - **Standard Headers**: `X-RateLimit-Limit`, `X-RateLimit-Remaining`,
//!   `X-RateLimit-Reset`, `X-RateLimit-Policy`, `X-RateLimit-Backend`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tollgate_ratelimit::{
//!     AdmissionMiddleware, ConfigResolver, MigrationFacade, RateLimitResult,
//! };
//!
//! # async fn example() -> RateLimitResult<()> {
//! let resolver = ConfigResolver::from_env()?;
//! let settings = resolver.resolve()?;
//!
//! let facade = Arc::new(MigrationFacade::builder(settings).build()?);
//! let middleware = AdmissionMiddleware::new(facade).with_health_path("/health/ratelimit");
//! # let _ = middleware;
//! # Ok(())
//! # }
//! ```
//!
//! ## Window semantics
//!
//! With `{per_second: 10, burst: 20}`, 25 requests in one second admit 20:
//! ten fill the second window and ten more draw burst credit. The remaining
//! five are denied with `limit_type = burst`. A denied request writes no
//! counter.

pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod facade;
pub mod key;
pub mod metrics;
pub mod middleware;
pub mod stores;
pub mod window;

pub use config::{
    ConfigResolver, Environment, LimitOverrides, MigrationStrategy, RateLimitConfig,
    RateLimitSettings, RateLimitSettingsBuilder,
};
pub use decision::{Backend, RateLimitDecision};
pub use engine::{Limiter, RateLimitEngine};
pub use error::{RateLimitError, RateLimitHeaders, RateLimitResult};
pub use facade::{
    FacadeSnapshot, HealthStatus, HybridLimiter, MigrationFacade, MigrationFacadeBuilder,
    ReachabilityProbe, ReloadHandle,
};
pub use key::{
    CallerIdentity, EndpointClass, EndpointClassifier, KeyScope, PeerAddr, RateLimitKey,
    resolve_client_ip,
};
pub use metrics::AdmissionMetrics;
pub use middleware::{AdmissionMiddleware, AdmissionOutcome, DenyReason, Middleware, Next};
pub use stores::{CounterStore, MemoryStore, PlanOutcome};
pub use window::{CounterState, Window, WindowMode, WindowPlan};

#[cfg(feature = "redis")]
pub use stores::RedisStore;
