// Tollgate - distributed rate limiting with fail-closed admission control
//
// This library bundles the rate limiting engine, the admission middleware and
// the migration facade, with optional Redis, configuration and logging crates.

// Re-export the rate limiter
#[cfg(feature = "ratelimit")]
pub use tollgate_ratelimit::*;

// Re-export optional crates
#[cfg(feature = "config")]
pub use tollgate_config;

#[cfg(feature = "log")]
pub use tollgate_log;

#[cfg(feature = "redis")]
pub use tollgate_redis;

// Prelude for common imports
#[cfg(feature = "ratelimit")]
pub mod prelude {
    pub use crate::{
        AdmissionMiddleware,
        AdmissionOutcome,
        Backend,
        CallerIdentity,
        ConfigResolver,
        CounterStore,
        EndpointClass,
        Environment,
        MemoryStore,
        Middleware,
        MigrationFacade,
        MigrationStrategy,
        Next,
        RateLimitConfig,
        RateLimitDecision,
        RateLimitError,
        RateLimitKey,
        RateLimitSettings,
    };

    #[cfg(feature = "redis")]
    pub use crate::RedisStore;
}
