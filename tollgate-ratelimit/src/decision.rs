//! Admission decisions.

use crate::window::Window;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Which implementation served a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process counters, no cross-instance consistency.
    Legacy,
    /// Shared store counters.
    Distributed,
    /// No backend could decide; the outage policy produced the decision.
    Unavailable,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Legacy => "legacy",
            Backend::Distributed => "distributed",
            Backend::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one request. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the most constraining window.
    pub remaining: u64,
    /// Ceiling of the window reported in `limit_type`.
    pub limit: u64,
    /// Unix timestamp (seconds) at which `limit_type`'s window resets.
    pub reset_at: u64,
    /// Set on denial.
    pub retry_after: Option<Duration>,
    /// Window that denied the request, or the most constraining window when
    /// admitted. `None` when no backend was reachable.
    pub limit_type: Option<Window>,
    pub backend: Backend,
}

impl RateLimitDecision {
    pub fn allowed(
        remaining: u64,
        limit: u64,
        reset_at: u64,
        limit_type: Window,
        backend: Backend,
    ) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_at,
            retry_after: None,
            limit_type: Some(limit_type),
            backend,
        }
    }

    pub fn denied(
        limit: u64,
        reset_at: u64,
        retry_after: Duration,
        limit_type: Window,
        backend: Backend,
    ) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_at,
            retry_after: Some(retry_after),
            limit_type: Some(limit_type),
            backend,
        }
    }

    /// Decision produced by the outage policy.
    ///
    /// Fail-open admits and reports the full ceiling as remaining since
    /// nothing was counted; fail-closed denies with `retry_after`.
    pub fn unavailable(fail_open: bool, limit: u64, retry_after: Duration) -> Self {
        let now = unix_now();
        if fail_open {
            Self {
                allowed: true,
                remaining: limit,
                limit,
                reset_at: now,
                retry_after: None,
                limit_type: None,
                backend: Backend::Unavailable,
            }
        } else {
            Self {
                allowed: false,
                remaining: 0,
                limit,
                reset_at: now + ceil_secs(retry_after),
                retry_after: Some(retry_after),
                limit_type: None,
                backend: Backend::Unavailable,
            }
        }
    }

    /// Whether this denial came from the outage policy rather than quota.
    pub fn is_outage(&self) -> bool {
        self.backend == Backend::Unavailable
    }

    /// Retry-After header value, rounded up, at least one second.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| ceil_secs(d).max(1))
    }
}

/// Current Unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Round a duration up to whole seconds.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}
