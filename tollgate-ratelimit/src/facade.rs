//! Migration facade
//!
//! Routes every request to the limiter selected by the active
//! [`MigrationStrategy`]:
//!
//! - **Legacy**: process-local counters
//! - **DistributedOnly**: shared store counters
//! - **Hybrid**: both evaluated concurrently; the configured enforcer's
//!   decision is returned, the other is only compared and logged
//!
//! The strategy is switched by reloading settings; no restart is needed and
//! the limiter swap is atomic for in-flight callers, which keep the snapshot
//! they started with.

use crate::config::{ConfigResolver, MigrationStrategy, RateLimitConfig, RateLimitSettings};
use crate::decision::{Backend, RateLimitDecision};
use crate::engine::{Limiter, RateLimitEngine};
use crate::error::{RateLimitError, RateLimitResult};
use crate::key::{EndpointClass, KeyScope, RateLimitKey};
use crate::metrics::AdmissionMetrics;
use crate::stores::{CounterStore, MemoryStore};
use async_trait::async_trait;
use futures::future;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reports whether the shared store is reachable without touching it.
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self) -> bool;
}

#[cfg(feature = "redis")]
impl ReachabilityProbe for tollgate_redis::PoolHealth {
    fn is_reachable(&self) -> bool {
        tollgate_redis::PoolHealth::is_reachable(self)
    }
}

/// Runs legacy and distributed limiters side by side.
pub struct HybridLimiter {
    legacy: Arc<dyn Limiter>,
    distributed: Arc<dyn Limiter>,
    enforcer: Backend,
    disagreements: Arc<AtomicU64>,
    metrics: Option<AdmissionMetrics>,
}

impl HybridLimiter {
    pub fn new(
        legacy: Arc<dyn Limiter>,
        distributed: Arc<dyn Limiter>,
        enforcer: Backend,
        disagreements: Arc<AtomicU64>,
        metrics: Option<AdmissionMetrics>,
    ) -> Self {
        Self {
            legacy,
            distributed,
            enforcer,
            disagreements,
            metrics,
        }
    }

    pub fn enforcer(&self) -> Backend {
        self.enforcer
    }
}

#[async_trait]
impl Limiter for HybridLimiter {
    async fn evaluate(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
    ) -> RateLimitResult<RateLimitDecision> {
        let (legacy, distributed) = future::join(
            self.legacy.evaluate(key, config),
            self.distributed.evaluate(key, config),
        )
        .await;

        let (enforced, shadow) = match self.enforcer {
            Backend::Distributed => (distributed, legacy),
            _ => (legacy, distributed),
        };

        match (&enforced, &shadow) {
            (Ok(enforced), Ok(shadow)) if enforced.allowed != shadow.allowed => {
                self.disagreements.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_disagreement();
                }
                warn!(
                    key = %key,
                    enforcer = %self.enforcer,
                    enforced_allowed = enforced.allowed,
                    shadow_allowed = shadow.allowed,
                    enforced_window = ?enforced.limit_type,
                    shadow_window = ?shadow.limit_type,
                    "Hybrid backends disagree"
                );
            }
            (_, Err(err)) => {
                debug!(key = %key, error = %err, "Shadow backend failed, ignoring");
            }
            _ => {}
        }

        enforced
    }

    fn backend(&self) -> Backend {
        self.enforcer
    }

    async fn ping(&self) -> RateLimitResult<()> {
        match self.enforcer {
            Backend::Distributed => self.distributed.ping().await,
            _ => self.legacy.ping().await,
        }
    }
}

/// Settings and limiter in effect at one point in time.
#[derive(Clone)]
pub struct FacadeSnapshot {
    pub settings: Arc<RateLimitSettings>,
    pub limiter: Arc<dyn Limiter>,
}

/// Health payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub migration_strategy: MigrationStrategy,
    pub distributed_enabled: bool,
    pub backend_reachable: bool,
    pub fail_open_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_enforcer: Option<Backend>,
    pub hybrid_disagreements: u64,
}

/// Strategy-selecting front of the rate limiter
pub struct MigrationFacade {
    legacy_store: Arc<dyn CounterStore>,
    distributed_store: Option<Arc<dyn CounterStore>>,
    state: RwLock<FacadeSnapshot>,
    disagreements: Arc<AtomicU64>,
    metrics: Option<AdmissionMetrics>,
    reachability: Option<Arc<dyn ReachabilityProbe>>,
}

impl MigrationFacade {
    pub fn builder(settings: RateLimitSettings) -> MigrationFacadeBuilder {
        MigrationFacadeBuilder::new(settings)
    }

    /// Current settings and limiter
    pub fn snapshot(&self) -> FacadeSnapshot {
        self.state.read().clone()
    }

    pub fn settings(&self) -> Arc<RateLimitSettings> {
        Arc::clone(&self.state.read().settings)
    }

    pub fn strategy(&self) -> MigrationStrategy {
        self.state.read().settings.strategy
    }

    /// Whether a shared store was provided
    pub fn has_distributed_store(&self) -> bool {
        self.distributed_store.is_some()
    }

    pub fn metrics(&self) -> Option<&AdmissionMetrics> {
        self.metrics.as_ref()
    }

    pub fn disagreements(&self) -> u64 {
        self.disagreements.load(Ordering::Relaxed)
    }

    /// Evaluate a request with the active limiter and its endpoint config
    ///
    /// Anonymous keys use the anonymous limits when they are configured.
    pub async fn evaluate(
        &self,
        key: &RateLimitKey,
        class: &EndpointClass,
    ) -> RateLimitResult<RateLimitDecision> {
        let snapshot = self.snapshot();
        let config = match key.scope() {
            KeyScope::Anonymous => snapshot.settings.config_for_key(key),
            _ => snapshot.settings.config_for(class),
        };
        snapshot.limiter.evaluate(key, config).await
    }

    /// Swap in new settings
    ///
    /// Invalid settings, or a strategy needing a shared store that was never
    /// provided, are rejected and the current state is kept.
    pub fn reload(&self, settings: RateLimitSettings) -> RateLimitResult<()> {
        settings.validate()?;
        let limiter = self.build_limiter(&settings)?;

        let previous = {
            let mut state = self.state.write();
            let previous = state.settings.strategy;
            *state = FacadeSnapshot {
                settings: Arc::new(settings),
                limiter,
            };
            previous
        };

        let current = self.strategy();
        if previous != current {
            info!(from = %previous, to = %current, "Migration strategy changed");
        } else {
            debug!(strategy = %current, "Rate limit settings reloaded");
        }
        Ok(())
    }

    /// Revert to the legacy strategy, keeping every other setting
    pub fn rollback(&self) -> RateLimitResult<()> {
        let mut settings = (*self.settings()).clone();
        settings.strategy = MigrationStrategy::Legacy;
        warn!("Rolling back rate limiting to legacy strategy");
        self.reload(settings)
    }

    /// Health payload for operational checks
    pub async fn status(&self) -> HealthStatus {
        let settings = self.settings();
        let distributed_enabled =
            settings.strategy.requires_distributed() && self.distributed_store.is_some();

        let backend_reachable = match (&self.reachability, &self.distributed_store) {
            (Some(probe), Some(_)) => probe.is_reachable(),
            (None, Some(store)) => {
                RateLimitEngine::distributed(Arc::clone(store), settings.store_timeout)
                    .ping()
                    .await
                    .is_ok()
            }
            (_, None) => true,
        };

        let fail_open_configured = settings.defaults.fail_open
            || settings.endpoints.values().any(|config| config.fail_open);

        HealthStatus {
            migration_strategy: settings.strategy,
            distributed_enabled,
            backend_reachable,
            fail_open_configured,
            hybrid_enforcer: (settings.strategy == MigrationStrategy::Hybrid)
                .then_some(settings.hybrid_enforcer),
            hybrid_disagreements: self.disagreements(),
        }
    }

    /// The single place a strategy becomes a limiter
    fn build_limiter(&self, settings: &RateLimitSettings) -> RateLimitResult<Arc<dyn Limiter>> {
        build_limiter(
            settings,
            &self.legacy_store,
            self.distributed_store.as_ref(),
            &self.disagreements,
            self.metrics.as_ref(),
        )
    }
}

fn build_limiter(
    settings: &RateLimitSettings,
    legacy_store: &Arc<dyn CounterStore>,
    distributed_store: Option<&Arc<dyn CounterStore>>,
    disagreements: &Arc<AtomicU64>,
    metrics: Option<&AdmissionMetrics>,
) -> RateLimitResult<Arc<dyn Limiter>> {
    let legacy = || {
        Arc::new(RateLimitEngine::new(
            Arc::clone(legacy_store),
            Backend::Legacy,
            settings.store_timeout,
        ))
    };
    let distributed = || {
        distributed_store
            .map(|store| {
                Arc::new(RateLimitEngine::distributed(
                    Arc::clone(store),
                    settings.store_timeout,
                ))
            })
            .ok_or_else(|| {
                RateLimitError::config(format!(
                    "migration_strategy {} requires a shared store",
                    settings.strategy
                ))
            })
    };

    let limiter: Arc<dyn Limiter> = match settings.strategy {
        MigrationStrategy::Legacy => legacy(),
        MigrationStrategy::DistributedOnly => distributed()?,
        MigrationStrategy::Hybrid => Arc::new(HybridLimiter::new(
            legacy(),
            distributed()?,
            settings.hybrid_enforcer,
            Arc::clone(disagreements),
            metrics.cloned(),
        )),
    };
    Ok(limiter)
}

/// Builder for MigrationFacade
pub struct MigrationFacadeBuilder {
    settings: RateLimitSettings,
    distributed_store: Option<Arc<dyn CounterStore>>,
    metrics: Option<AdmissionMetrics>,
    reachability: Option<Arc<dyn ReachabilityProbe>>,
}

impl MigrationFacadeBuilder {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            distributed_store: None,
            metrics: None,
            reachability: None,
        }
    }

    /// Shared store for the distributed and hybrid strategies
    pub fn distributed_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.distributed_store = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: AdmissionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Source of `backend_reachable` in the health payload, typically the
    /// shared store's pool monitor
    pub fn reachability(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.reachability = Some(probe);
        self
    }

    pub fn build(self) -> RateLimitResult<MigrationFacade> {
        self.settings.validate()?;

        let legacy_store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        let disagreements = Arc::new(AtomicU64::new(0));
        let limiter = build_limiter(
            &self.settings,
            &legacy_store,
            self.distributed_store.as_ref(),
            &disagreements,
            self.metrics.as_ref(),
        )?;

        info!(
            strategy = %self.settings.strategy,
            environment = %self.settings.environment,
            distributed_store = self.distributed_store.as_ref().map(|s| s.store_type()),
            "Rate limiting initialised"
        );

        Ok(MigrationFacade {
            legacy_store,
            distributed_store: self.distributed_store,
            state: RwLock::new(FacadeSnapshot {
                settings: Arc::new(self.settings),
                limiter,
            }),
            disagreements,
            metrics: self.metrics,
            reachability: self.reachability,
        })
    }
}

/// Periodically re-resolves settings and applies them to a facade.
pub struct ReloadHandle {
    handle: JoinHandle<()>,
}

impl ReloadHandle {
    /// Spawn the reloader on the current tokio runtime.
    ///
    /// A configuration that fails to load or validate is logged and the
    /// facade keeps its previous settings.
    pub fn spawn(facade: Arc<MigrationFacade>, resolver: ConfigResolver, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; settings are already current.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let settings = match resolver.reload() {
                    Ok(settings) => settings,
                    Err(err) => {
                        error!(error = %err, "Rate limit configuration reload failed, keeping previous settings");
                        continue;
                    }
                };
                if *facade.settings() == settings {
                    continue;
                }
                if let Err(err) = facade.reload(settings) {
                    error!(error = %err, "Rejected reloaded rate limit settings, keeping previous settings");
                }
            }
        });

        Self { handle }
    }

    /// Stop reloading.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for ReloadHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CallerIdentity;
    use std::sync::atomic::AtomicBool;

    fn key() -> RateLimitKey {
        RateLimitKey::derive(
            &CallerIdentity::new().with_organization("o").with_user("u"),
            &EndpointClass::Api,
        )
        .unwrap()
    }

    fn settings(strategy: MigrationStrategy) -> RateLimitSettings {
        RateLimitSettings::builder()
            .environment(crate::config::Environment::Test)
            .strategy(strategy)
            .build()
            .unwrap()
    }

    struct Probe(AtomicBool);

    impl ReachabilityProbe for Probe {
        fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_legacy_strategy() {
        let facade = MigrationFacade::builder(settings(MigrationStrategy::Legacy))
            .build()
            .unwrap();

        let decision = facade.evaluate(&key(), &EndpointClass::Api).await.unwrap();
        assert_eq!(decision.backend, Backend::Legacy);
        assert_eq!(facade.strategy(), MigrationStrategy::Legacy);
    }

    #[test]
    fn test_distributed_requires_store() {
        let result = MigrationFacade::builder(settings(MigrationStrategy::DistributedOnly)).build();
        assert!(matches!(result, Err(RateLimitError::ConfigInvalid(_))));

        let facade = MigrationFacade::builder(settings(MigrationStrategy::Legacy))
            .build()
            .unwrap();
        assert!(
            facade
                .reload(settings(MigrationStrategy::Hybrid))
                .is_err()
        );
        assert_eq!(facade.strategy(), MigrationStrategy::Legacy);
    }

    #[tokio::test]
    async fn test_reload_and_rollback() {
        let facade = MigrationFacade::builder(settings(MigrationStrategy::Legacy))
            .distributed_store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();

        facade
            .reload(settings(MigrationStrategy::DistributedOnly))
            .unwrap();
        let decision = facade.evaluate(&key(), &EndpointClass::Api).await.unwrap();
        assert_eq!(decision.backend, Backend::Distributed);

        facade.rollback().unwrap();
        assert_eq!(facade.strategy(), MigrationStrategy::Legacy);
        let decision = facade.evaluate(&key(), &EndpointClass::Api).await.unwrap();
        assert_eq!(decision.backend, Backend::Legacy);
    }

    #[tokio::test]
    async fn test_hybrid_enforcer_wins_and_disagreements_counted() {
        let shared = Arc::new(MemoryStore::new());
        let hybrid = RateLimitSettings::builder()
            .environment(crate::config::Environment::Test)
            .strategy(MigrationStrategy::Hybrid)
            .hybrid_enforcer(Backend::Legacy)
            .build()
            .unwrap();
        let metrics = AdmissionMetrics::new().unwrap();
        let facade = MigrationFacade::builder(hybrid)
            .distributed_store(shared.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        // Another instance drains the shared bucket.
        let other = RateLimitEngine::distributed(shared, Duration::from_millis(500));
        let config = facade.settings().defaults.clone();
        for _ in 0..config.burst {
            other.evaluate(&key(), &config).await.unwrap();
        }

        let decision = facade.evaluate(&key(), &EndpointClass::Api).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.backend, Backend::Legacy);
        assert_eq!(facade.disagreements(), 1);
        assert_eq!(metrics.disagreements(), 1);

        let status = facade.status().await;
        assert_eq!(status.hybrid_enforcer, Some(Backend::Legacy));
        assert_eq!(status.hybrid_disagreements, 1);
    }

    #[tokio::test]
    async fn test_status() {
        let probe = Arc::new(Probe(AtomicBool::new(true)));
        let facade = MigrationFacade::builder(settings(MigrationStrategy::DistributedOnly))
            .distributed_store(Arc::new(MemoryStore::new()))
            .reachability(probe.clone())
            .build()
            .unwrap();

        let status = facade.status().await;
        assert_eq!(status.migration_strategy, MigrationStrategy::DistributedOnly);
        assert!(status.distributed_enabled);
        assert!(status.backend_reachable);
        assert!(!status.fail_open_configured);
        assert_eq!(status.hybrid_enforcer, None);

        probe.0.store(false, Ordering::SeqCst);
        assert!(!facade.status().await.backend_reachable);

        let json = serde_json::to_value(facade.status().await).unwrap();
        assert_eq!(json["migration_strategy"], "distributed_only");
        assert!(json.get("hybrid_enforcer").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_handle_applies_and_keeps_on_error() {
        let manager = tollgate_config::ConfigManager::new();
        let service = tollgate_config::ConfigService::from_manager(manager.clone());
        let resolver = ConfigResolver::from_service(service);

        let facade = Arc::new(
            MigrationFacade::builder(resolver.resolve().unwrap())
                .distributed_store(Arc::new(MemoryStore::new()))
                .build()
                .unwrap(),
        );
        let handle = ReloadHandle::spawn(facade.clone(), resolver, Duration::from_secs(10));

        manager.set("migration_strategy", "distributed_only").unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(facade.strategy(), MigrationStrategy::DistributedOnly);

        manager.set("per_second", 0).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(facade.strategy(), MigrationStrategy::DistributedOnly);
        assert_eq!(facade.settings().defaults.per_second, 10);

        handle.shutdown();
    }
}
