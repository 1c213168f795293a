//! In-memory counter store
//!
//! Uses DashMap for thread-safe concurrent access; the entry lock of a bucket
//! makes check-and-increment atomic. Counters are local to the process, so
//! this store gives no cross-instance consistency.
//!
//! Expired buckets are swept from the request path at most once per sweep
//! interval, so memory is bounded by the buckets live within the longest
//! window.

use crate::error::RateLimitResult;
use crate::stores::{CounterStore, PlanOutcome};
use crate::window::{CounterState, Window, WindowPlan};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: Instant,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Default time between sweeps of expired buckets
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-memory counter store
pub struct MemoryStore {
    buckets: DashMap<String, HashMap<Window, Slot>>,
    sweep_interval: Duration,
    next_sweep: Mutex<Instant>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a store sweeping expired buckets at most once per `interval`
    pub fn with_sweep_interval(interval: Duration) -> Self {
        debug!(sweep_interval = ?interval, "Creating new in-memory counter store");
        Self {
            buckets: DashMap::new(),
            sweep_interval: interval,
            next_sweep: Mutex::new(Instant::now() + interval),
        }
    }

    /// Get the number of tracked buckets (for monitoring)
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Remove buckets whose counters have all expired, returning how many
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, slots| {
            slots.retain(|_, slot| slot.live(now));
            !slots.is_empty()
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Sweep if the interval has elapsed and no other caller is sweeping.
    ///
    /// Must not be called while holding a bucket entry: `retain` locks every
    /// shard.
    fn sweep_if_due(&self, now: Instant) {
        let Some(mut next) = self.next_sweep.try_lock() else {
            return;
        };
        if now < *next {
            return;
        }
        *next = now + self.sweep_interval;
        drop(next);

        let evicted = self.cleanup();
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "Swept expired buckets");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn check_and_increment(
        &self,
        bucket: &str,
        plan: &WindowPlan,
    ) -> RateLimitResult<PlanOutcome> {
        trace!(bucket = %bucket, "Memory check and increment");

        let now = Instant::now();
        self.sweep_if_due(now);
        let mut slots = self.buckets.entry(bucket.to_string()).or_default();

        let counts: Vec<u64> = plan
            .specs()
            .iter()
            .map(|spec| {
                slots
                    .get(&spec.window)
                    .filter(|slot| slot.live(now))
                    .map_or(0, |slot| slot.count)
            })
            .collect();

        let verdict = plan.decide(&counts);

        if verdict.denied_by.is_none() {
            for (spec, increment) in plan.specs().iter().zip(&verdict.increments) {
                if !increment {
                    continue;
                }
                let slot = slots.entry(spec.window).or_insert(Slot {
                    count: 0,
                    expires_at: now,
                });
                if slot.live(now) {
                    slot.count += 1;
                } else {
                    *slot = Slot {
                        count: 1,
                        expires_at: now + spec.ttl,
                    };
                }
            }
        }

        let counters = plan
            .specs()
            .iter()
            .map(|spec| match slots.get(&spec.window) {
                Some(slot) if slot.live(now) => CounterState {
                    count: slot.count,
                    ttl: Some(slot.expires_at - now),
                },
                _ => CounterState::default(),
            })
            .collect();

        Ok(PlanOutcome {
            denied_by: verdict.denied_by,
            counters,
        })
    }

    async fn reset(&self, bucket: &str) -> RateLimitResult<()> {
        self.buckets.remove(bucket);
        Ok(())
    }

    async fn ping(&self) -> RateLimitResult<()> {
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
