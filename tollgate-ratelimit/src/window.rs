//! Counting windows and the per-request evaluation plan.
//!
//! A request is checked against up to four fixed windows in priority order:
//! second, minute, hour, burst. The second window is *soft* when burst credit
//! exists: once it is full, further requests in that second draw from the
//! burst window's credit (`burst - per_second` requests per burst window)
//! instead of being denied outright. Minute and hour windows are hard.
//!
//! Evaluation is check-then-commit: every window is inspected first, and
//! counters are only written when the request is admitted. A denied request
//! leaves all counters untouched.

use crate::config::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Second,
    Minute,
    Hour,
    Burst,
}

impl Window {
    /// Evaluation and reporting priority.
    pub const PRIORITY: [Window; 4] = [Window::Second, Window::Minute, Window::Hour, Window::Burst];

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Second => "second",
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Burst => "burst",
        }
    }

    /// Suffix of the counter key in the store.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Window::Second => "s",
            Window::Minute => "m",
            Window::Hour => "h",
            Window::Burst => "b",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a window takes part in the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// Denies once the threshold is reached.
    Hard,
    /// Spills into the credit window once full; denies only if no credit
    /// window is planned.
    Overflow,
    /// Consulted and charged only for requests that overflowed.
    Credit,
}

impl WindowMode {
    /// Wire code used by the store script.
    pub fn code(&self) -> u8 {
        match self {
            WindowMode::Hard => 0,
            WindowMode::Overflow => 1,
            WindowMode::Credit => 2,
        }
    }
}

/// One window of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub window: Window,
    pub limit: u64,
    pub ttl: Duration,
    pub mode: WindowMode,
}

/// Live counter as observed by a store after evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterState {
    pub count: u64,
    /// Time until the counter expires; `None` if no counter exists.
    pub ttl: Option<Duration>,
}

/// Result of applying a plan to a set of counter values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub denied_by: Option<Window>,
    /// Which counters to increment, aligned with the plan's specs.
    pub increments: Vec<bool>,
}

/// Ordered windows to check for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    specs: Vec<WindowSpec>,
}

impl WindowPlan {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut specs = vec![
            WindowSpec {
                window: Window::Second,
                limit: config.per_second,
                ttl: Duration::from_secs(1),
                mode: WindowMode::Overflow,
            },
            WindowSpec {
                window: Window::Minute,
                limit: config.per_minute,
                ttl: Duration::from_secs(60),
                mode: WindowMode::Hard,
            },
            WindowSpec {
                window: Window::Hour,
                limit: config.per_hour,
                ttl: Duration::from_secs(3600),
                mode: WindowMode::Hard,
            },
        ];

        let credit = config.burst_credit();
        if credit > 0 {
            specs.push(WindowSpec {
                window: Window::Burst,
                limit: credit,
                ttl: config.burst_window,
                mode: WindowMode::Credit,
            });
        }

        Self { specs }
    }

    pub fn specs(&self) -> &[WindowSpec] {
        &self.specs
    }

    pub fn position(&self, window: Window) -> Option<usize> {
        self.specs.iter().position(|s| s.window == window)
    }

    pub fn has_credit(&self) -> bool {
        self.specs.iter().any(|s| s.mode == WindowMode::Credit)
    }

    /// Decide admission from current counter values (aligned with specs).
    ///
    /// Stores that cannot run this function server-side must reproduce it
    /// exactly; the Redis script is a line-by-line port.
    pub fn decide(&self, counts: &[u64]) -> Verdict {
        let has_credit = self.has_credit();
        let mut increments = vec![false; self.specs.len()];
        let mut overflow = false;

        for (i, spec) in self.specs.iter().enumerate() {
            let count = counts.get(i).copied().unwrap_or(0);
            match spec.mode {
                WindowMode::Hard => {
                    if count >= spec.limit {
                        return Verdict::denied(spec.window, self.specs.len());
                    }
                    increments[i] = true;
                }
                WindowMode::Overflow => {
                    if count < spec.limit {
                        increments[i] = true;
                    } else if has_credit {
                        overflow = true;
                    } else {
                        return Verdict::denied(spec.window, self.specs.len());
                    }
                }
                WindowMode::Credit => {
                    if overflow {
                        if count >= spec.limit {
                            return Verdict::denied(spec.window, self.specs.len());
                        }
                        increments[i] = true;
                    }
                }
            }
        }

        Verdict {
            denied_by: None,
            increments,
        }
    }
}

impl Verdict {
    fn denied(window: Window, len: usize) -> Self {
        Self {
            denied_by: Some(window),
            increments: vec![false; len],
        }
    }
}
