//! Error types for rate limiting

use crate::config::RateLimitConfig;
use crate::decision::{RateLimitDecision, unix_now};
use thiserror::Error;

/// Result type for rate limiting operations
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Rate limiting errors
///
/// A quota denial is not an error: it is a [`RateLimitDecision`] with
/// `allowed == false`.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Malformed or missing thresholds. Fatal at startup.
    #[error("Invalid rate limit configuration: {0}")]
    ConfigInvalid(String),

    /// Shared store unreachable or timed out. Governed by the outage policy.
    #[error("Rate limit backend unavailable: {reason}")]
    BackendUnavailable {
        /// What went wrong talking to the store
        reason: String,
    },

    /// No caller identity, not even a client IP
    #[error("Failed to derive rate limit key: {0}")]
    KeyDerivation(String),

    /// Raw store failure
    #[error("Rate limit store error: {0}")]
    Store(String),
}

impl RateLimitError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Create a new backend unavailable error
    pub fn unavailable<S: Into<String>>(reason: S) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a new key derivation error
    pub fn key_derivation<S: Into<String>>(msg: S) -> Self {
        Self::KeyDerivation(msg.into())
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Check if this error should trigger the outage policy
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::Store(_))
    }
}

impl From<tollgate_config::ConfigError> for RateLimitError {
    fn from(err: tollgate_config::ConfigError) -> Self {
        Self::ConfigInvalid(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<tollgate_redis::RedisError> for RateLimitError {
    fn from(err: tollgate_redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<tollgate_redis::redis::RedisError> for RateLimitError {
    fn from(err: tollgate_redis::redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Standard rate limit headers
///
/// The same five headers are produced for every decision regardless of the
/// backend that served it; `Retry-After` is added on denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// X-RateLimit-Limit: ceiling of the reported window
    pub limit: u64,
    /// X-RateLimit-Remaining: requests remaining in the reported window
    pub remaining: u64,
    /// X-RateLimit-Reset: Unix timestamp when the reported window resets
    pub reset: u64,
    /// X-RateLimit-Policy: reported window, or `none` when no backend decided
    pub policy: &'static str,
    /// X-RateLimit-Backend: backend that served the decision
    pub backend: &'static str,
    /// Retry-After: seconds until the client should retry (only when limited)
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub const LIMIT: &'static str = "X-RateLimit-Limit";
    pub const REMAINING: &'static str = "X-RateLimit-Remaining";
    pub const RESET: &'static str = "X-RateLimit-Reset";
    pub const POLICY: &'static str = "X-RateLimit-Policy";
    pub const BACKEND: &'static str = "X-RateLimit-Backend";
    pub const RETRY_AFTER: &'static str = "Retry-After";

    /// Build headers from a decision
    pub fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at,
            policy: decision.limit_type.map(|w| w.as_str()).unwrap_or("none"),
            backend: decision.backend.as_str(),
            retry_after: if decision.allowed {
                None
            } else {
                decision.retry_after_secs()
            },
        }
    }

    /// Headers for a bypass key: full quota, served by no backend
    pub fn bypass(config: &RateLimitConfig) -> Self {
        Self {
            limit: config.burst,
            remaining: config.burst,
            reset: unix_now() + 1,
            policy: "none",
            backend: "bypass",
            retry_after: None,
        }
    }

    /// Get header name/value pairs
    pub fn to_header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (Self::LIMIT, self.limit.to_string()),
            (Self::REMAINING, self.remaining.to_string()),
            (Self::RESET, self.reset.to_string()),
            (Self::POLICY, self.policy.to_string()),
            (Self::BACKEND, self.backend.to_string()),
        ];

        if let Some(retry) = self.retry_after {
            headers.push((Self::RETRY_AFTER, retry.to_string()));
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Backend;
    use crate::window::Window;
    use std::time::Duration;

    #[test]
    fn test_backend_unavailable_error() {
        let error = RateLimitError::unavailable("connection refused");
        assert!(error.is_backend_unavailable());
        assert!(error.to_string().contains("connection refused"));

        assert!(RateLimitError::store("boom").is_backend_unavailable());
        assert!(!RateLimitError::config("per_second missing").is_backend_unavailable());
        assert!(!RateLimitError::key_derivation("no ip").is_backend_unavailable());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: RateLimitError =
            tollgate_config::ConfigError::invalid("per_second", "not a number").into();
        assert!(matches!(err, RateLimitError::ConfigInvalid(_)));
        assert!(err.to_string().contains("per_second"));
    }

    #[test]
    fn test_headers_for_denial() {
        let decision = RateLimitDecision::denied(
            20,
            1234567890,
            Duration::from_secs(1),
            Window::Burst,
            Backend::Distributed,
        );
        let pairs = RateLimitHeaders::from_decision(&decision).to_header_pairs();

        assert_eq!(pairs.len(), 6);
        assert!(
            pairs
                .iter()
                .any(|(k, v)| *k == "X-RateLimit-Limit" && v == "20")
        );
        assert!(
            pairs
                .iter()
                .any(|(k, v)| *k == "X-RateLimit-Remaining" && v == "0")
        );
        assert!(
            pairs
                .iter()
                .any(|(k, v)| *k == "X-RateLimit-Policy" && v == "burst")
        );
        assert!(
            pairs
                .iter()
                .any(|(k, v)| *k == "X-RateLimit-Backend" && v == "distributed")
        );
        assert!(pairs.iter().any(|(k, v)| *k == "Retry-After" && v == "1"));
    }

    #[test]
    fn test_headers_for_bypass() {
        let config = RateLimitConfig::default();
        let headers = RateLimitHeaders::bypass(&config);

        assert_eq!(headers.backend, "bypass");
        assert_eq!(headers.limit, config.burst);
        assert_eq!(headers.remaining, config.burst);
        assert!(headers.reset > unix_now());
        assert_eq!(headers.to_header_pairs().len(), 5);
    }

    #[test]
    fn test_headers_for_outage() {
        let decision = RateLimitDecision::unavailable(true, 10, Duration::from_secs(5));
        let headers = RateLimitHeaders::from_decision(&decision);

        assert_eq!(headers.policy, "none");
        assert_eq!(headers.backend, "unavailable");
        assert_eq!(headers.retry_after, None);
        assert_eq!(headers.to_header_pairs().len(), 5);
    }
}
