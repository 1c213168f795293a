//! Background health monitoring for the connection pool.
//!
//! The monitor pings the store on its own schedule so that an outage or pool
//! exhaustion shows up in health reports before request traffic trips over it.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{PoolStats, RedisError, Result};

/// Something that can be pinged and reports pool statistics.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<PoolStats>;
}

/// Last observed health of the store.
#[derive(Debug)]
pub struct PoolHealth {
    reachable: AtomicBool,
    consecutive_failures: AtomicU64,
    checks: AtomicU64,
    last_error: RwLock<Option<String>>,
    last_stats: RwLock<PoolStats>,
}

impl PoolHealth {
    fn new() -> Self {
        Self {
            // Optimistic until the first probe lands
            reachable: AtomicBool::new(true),
            consecutive_failures: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            last_error: RwLock::new(None),
            last_stats: RwLock::new(PoolStats::default()),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn last_stats(&self) -> PoolStats {
        *self.last_stats.read()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            reachable: self.is_reachable(),
            consecutive_failures: self.consecutive_failures(),
            last_error: self.last_error(),
            pool: self.last_stats(),
        }
    }

    fn record_success(&self, stats: PoolStats) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let was_reachable = self.reachable.swap(true, Ordering::AcqRel);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_error.write() = None;
        *self.last_stats.write() = stats;

        if !was_reachable {
            info!("Shared store reachable again");
        }
        if stats.is_exhausted() {
            warn!(
                connections = stats.connections,
                max_size = stats.max_size,
                "Connection pool exhausted"
            );
        } else {
            debug!(
                connections = stats.connections,
                idle = stats.idle_connections,
                "Shared store health check passed"
            );
        }
    }

    fn record_failure(&self, err: &RedisError) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let was_reachable = self.reachable.swap(false, Ordering::AcqRel);
        *self.last_error.write() = Some(err.to_string());

        if was_reachable {
            warn!(error = %err, "Shared store health check failed");
        } else {
            debug!(error = %err, failures, "Shared store still unreachable");
        }
    }
}

/// Serializable view of [`PoolHealth`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub reachable: bool,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub pool: PoolStats,
}

/// Periodically probes the store and records the outcome.
pub struct PoolMonitor {
    health: Arc<PoolHealth>,
    handle: JoinHandle<()>,
}

impl PoolMonitor {
    /// Spawn the monitor on the current tokio runtime.
    ///
    /// Each probe is bounded by `timeout`; a probe that does not answer in
    /// time counts as a failure.
    pub fn spawn(probe: Arc<dyn HealthProbe>, interval: Duration, timeout: Duration) -> Self {
        let health = Arc::new(PoolHealth::new());
        let task_health = Arc::clone(&health);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match tokio::time::timeout(timeout, probe.probe()).await {
                    Ok(Ok(stats)) => task_health.record_success(stats),
                    Ok(Err(err)) => task_health.record_failure(&err),
                    Err(_) => task_health.record_failure(&RedisError::Timeout),
                }
            }
        });

        Self { health, handle }
    }

    pub fn health(&self) -> Arc<PoolHealth> {
        Arc::clone(&self.health)
    }

    /// Stop probing.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for PoolMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ToggleProbe {
        up: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for ToggleProbe {
        async fn probe(&self) -> Result<PoolStats> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.up.load(Ordering::SeqCst) {
                Ok(PoolStats {
                    connections: 2,
                    idle_connections: 1,
                    max_size: 4,
                })
            } else {
                Err(RedisError::Connection("connection refused".into()))
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_tracks_outage_and_recovery() {
        let probe = Arc::new(ToggleProbe {
            up: AtomicBool::new(true),
            hang: AtomicBool::new(false),
        });
        let monitor = PoolMonitor::spawn(
            probe.clone(),
            Duration::from_secs(1),
            Duration::from_millis(200),
        );
        let health = monitor.health();

        settle().await;
        assert!(health.is_reachable());
        assert_eq!(health.last_stats().connections, 2);

        probe.up.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(!health.is_reachable());
        assert_eq!(health.consecutive_failures(), 1);
        assert!(health.last_error().unwrap().contains("refused"));

        probe.up.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(health.is_reachable());
        assert_eq!(health.consecutive_failures(), 0);
        assert!(health.last_error().is_none());

        monitor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_counts_as_failure() {
        let probe = Arc::new(ToggleProbe {
            up: AtomicBool::new(true),
            hang: AtomicBool::new(true),
        });
        let monitor = PoolMonitor::spawn(probe, Duration::from_secs(1), Duration::from_millis(200));
        let health = monitor.health();

        settle().await;
        tokio::time::advance(Duration::from_millis(250)).await;
        settle().await;

        assert!(!health.is_reachable());
        assert_eq!(health.snapshot().last_error.as_deref(), Some("Operation timed out"));
    }
}
