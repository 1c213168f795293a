//! Rate limit configuration and its resolver
//!
//! Settings are resolved from, in increasing precedence: the built-in profile
//! of the selected environment, an optional configuration file, a `.env` file
//! and `TOLLGATE_*` environment variables. Invalid settings are never patched
//! up silently: [`ConfigResolver::resolve`] refuses them, and
//! [`ConfigResolver::resolve_or_safe_defaults`] replaces them wholesale with
//! strict production limits.

use crate::decision::Backend;
use crate::error::{RateLimitError, RateLimitResult};
use crate::key::{EndpointClass, KeyScope, RateLimitKey};
use crate::window::Window;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tollgate_config::{ConfigService, ConfigValidator};
use tracing::{debug, error};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Upper bound for the store round-trip timeout
pub const MAX_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
    Test,
}

impl Environment {
    pub fn parse(value: &str) -> RateLimitResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(RateLimitError::config(format!(
                "unknown environment {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Test => "test",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which implementation enforces limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    /// In-process counters only
    #[default]
    Legacy,
    /// Shared store counters only
    DistributedOnly,
    /// Both evaluated, one enforces
    Hybrid,
}

impl MigrationStrategy {
    pub fn parse(value: &str) -> RateLimitResult<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "legacy" => Ok(Self::Legacy),
            "distributed_only" | "distributed" => Ok(Self::DistributedOnly),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(RateLimitError::config(format!(
                "unknown migration_strategy {:?}, expected legacy, distributed_only or hybrid",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::DistributedOnly => "distributed_only",
            Self::Hybrid => "hybrid",
        }
    }

    /// Whether this strategy needs the shared store
    pub fn requires_distributed(&self) -> bool {
        !matches!(self, Self::Legacy)
    }
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: u64,
    pub per_minute: u64,
    pub per_hour: u64,
    /// Ceiling within one second including burst credit
    pub burst: u64,
    /// Length of the burst credit window
    pub burst_window: Duration,
    /// Admit requests when the backend is unavailable
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::defaults_for(Environment::Development)
    }
}

impl RateLimitConfig {
    /// Built-in profile of an environment
    pub fn defaults_for(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self {
                per_second: 5,
                per_minute: 120,
                per_hour: 2000,
                burst: 10,
                burst_window: Duration::from_secs(1),
                fail_open: false,
            },
            Environment::Development | Environment::Staging | Environment::Test => Self {
                per_second: 10,
                per_minute: 300,
                per_hour: 5000,
                burst: 20,
                burst_window: Duration::from_secs(1),
                fail_open: false,
            },
        }
    }

    /// Requests per burst window allowed beyond `per_second`
    pub fn burst_credit(&self) -> u64 {
        self.burst.saturating_sub(self.per_second)
    }

    /// Advertised ceiling of a window
    pub fn ceiling(&self, window: Window) -> u64 {
        match window {
            Window::Second | Window::Burst => self.burst,
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
        }
    }

    pub fn validate(&self) -> RateLimitResult<()> {
        ConfigValidator::positive(to_i64(self.per_second), "per_second")?;
        ConfigValidator::positive(to_i64(self.per_minute), "per_minute")?;
        ConfigValidator::positive(to_i64(self.per_hour), "per_hour")?;
        ConfigValidator::positive(to_i64(self.burst), "burst")?;
        ConfigValidator::at_least(self.burst, self.per_second, "burst", "per_second")?;
        ConfigValidator::at_least(self.per_minute, self.per_second, "per_minute", "per_second")?;
        ConfigValidator::at_least(self.per_hour, self.per_minute, "per_hour", "per_minute")?;
        ConfigValidator::in_range(self.burst_window.as_secs(), 1, 3600, "burst_window_secs")?;
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Partial thresholds, applied over a base config
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitOverrides {
    pub per_second: Option<u64>,
    pub per_minute: Option<u64>,
    pub per_hour: Option<u64>,
    pub burst: Option<u64>,
    pub burst_window_secs: Option<u64>,
    pub fail_open: Option<bool>,
}

impl LimitOverrides {
    pub fn apply(&self, base: &RateLimitConfig) -> RateLimitConfig {
        RateLimitConfig {
            per_second: self.per_second.unwrap_or(base.per_second),
            per_minute: self.per_minute.unwrap_or(base.per_minute),
            per_hour: self.per_hour.unwrap_or(base.per_hour),
            burst: self.burst.unwrap_or(base.burst),
            burst_window: self
                .burst_window_secs
                .map(Duration::from_secs)
                .unwrap_or(base.burst_window),
            fail_open: self.fail_open.unwrap_or(base.fail_open),
        }
    }
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSettings {
    pub environment: Environment,
    pub strategy: MigrationStrategy,
    /// Backend whose decision is enforced in hybrid mode
    pub hybrid_enforcer: Backend,
    pub defaults: RateLimitConfig,
    pub endpoints: HashMap<EndpointClass, RateLimitConfig>,
    pub store_timeout: Duration,
    /// Retry-After advertised on fail-closed denials
    pub outage_retry_after: Duration,
    /// Namespace of counter keys in the shared store
    pub key_prefix: String,
    pub trust_forwarded_headers: bool,
    /// Keys that are never rate limited
    pub bypass_keys: Vec<String>,
    /// Thresholds of the shared anonymous bucket; endpoint limits when unset
    pub anonymous: Option<RateLimitConfig>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self::for_environment(Environment::Development)
    }
}

impl RateLimitSettings {
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            environment,
            strategy: MigrationStrategy::Legacy,
            hybrid_enforcer: Backend::Legacy,
            defaults: RateLimitConfig::defaults_for(environment),
            endpoints: HashMap::new(),
            store_timeout: Duration::from_millis(500),
            outage_retry_after: Duration::from_secs(5),
            key_prefix: "tollgate".to_string(),
            trust_forwarded_headers: true,
            bypass_keys: Vec::new(),
            anonymous: None,
        }
    }

    /// Hard-coded fallback: production limits, fail-closed, legacy strategy
    pub fn safe_defaults() -> Self {
        Self::for_environment(Environment::Production)
    }

    pub fn builder() -> RateLimitSettingsBuilder {
        RateLimitSettingsBuilder::new()
    }

    /// Thresholds for an endpoint class
    pub fn config_for(&self, class: &EndpointClass) -> &RateLimitConfig {
        self.endpoints.get(class).unwrap_or(&self.defaults)
    }

    /// Thresholds for a derived key
    ///
    /// Anonymous keys use the `anonymous` limits when configured.
    pub fn config_for_key(&self, key: &RateLimitKey) -> &RateLimitConfig {
        match (key.scope(), &self.anonymous) {
            (KeyScope::Anonymous, Some(anonymous)) => anonymous,
            _ => self.config_for(key.class()),
        }
    }

    /// Check if a key should bypass rate limiting
    pub fn should_bypass(&self, key: &str) -> bool {
        self.bypass_keys.iter().any(|k| k == key)
    }

    pub fn validate(&self) -> RateLimitResult<()> {
        self.defaults.validate()?;
        for (class, config) in &self.endpoints {
            config
                .validate()
                .map_err(|e| RateLimitError::config(format!("endpoints.{}: {}", class, e)))?;
        }
        if let Some(anonymous) = &self.anonymous {
            anonymous
                .validate()
                .map_err(|e| RateLimitError::config(format!("anonymous: {}", e)))?;
        }

        if self.environment.is_production() {
            let fail_open = std::iter::once(("defaults".to_string(), &self.defaults))
                .chain(
                    self.endpoints
                        .iter()
                        .map(|(class, config)| (format!("endpoints.{}", class), config)),
                )
                .chain(
                    self.anonymous
                        .iter()
                        .map(|config| ("anonymous".to_string(), config)),
                )
                .find(|(_, config)| config.fail_open);
            if let Some((scope, _)) = fail_open {
                return Err(RateLimitError::config(format!(
                    "fail_open is not allowed in production ({})",
                    scope
                )));
            }
        }

        if self.hybrid_enforcer == Backend::Unavailable {
            return Err(RateLimitError::config(
                "hybrid_enforcer must be legacy or distributed",
            ));
        }

        ConfigValidator::in_range(
            self.store_timeout.as_millis(),
            1,
            MAX_STORE_TIMEOUT.as_millis(),
            "store_timeout_ms",
        )?;
        ConfigValidator::in_range(
            self.outage_retry_after.as_secs(),
            1,
            3600,
            "outage_retry_after_secs",
        )?;
        ConfigValidator::not_empty(&self.key_prefix, "key_prefix")?;

        Ok(())
    }
}

/// Builder for RateLimitSettings
pub struct RateLimitSettingsBuilder {
    environment: Environment,
    strategy: MigrationStrategy,
    hybrid_enforcer: Backend,
    limits: Option<RateLimitConfig>,
    fail_open: Option<bool>,
    endpoints: HashMap<EndpointClass, RateLimitConfig>,
    store_timeout: Duration,
    outage_retry_after: Duration,
    key_prefix: String,
    trust_forwarded_headers: bool,
    bypass_keys: Vec<String>,
    anonymous: Option<RateLimitConfig>,
}

impl RateLimitSettingsBuilder {
    pub fn new() -> Self {
        let base = RateLimitSettings::default();
        Self {
            environment: base.environment,
            strategy: base.strategy,
            hybrid_enforcer: base.hybrid_enforcer,
            limits: None,
            fail_open: None,
            endpoints: HashMap::new(),
            store_timeout: base.store_timeout,
            outage_retry_after: base.outage_retry_after,
            key_prefix: base.key_prefix,
            trust_forwarded_headers: base.trust_forwarded_headers,
            bypass_keys: Vec::new(),
            anonymous: None,
        }
    }

    /// Select the environment; its profile applies unless limits are set
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn strategy(mut self, strategy: MigrationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn hybrid_enforcer(mut self, backend: Backend) -> Self {
        self.hybrid_enforcer = backend;
        self
    }

    /// Default thresholds for every endpoint class
    pub fn limits(mut self, config: RateLimitConfig) -> Self {
        self.limits = Some(config);
        self
    }

    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = Some(fail_open);
        self
    }

    /// Thresholds for callers with no usable identity
    pub fn anonymous_limits(mut self, config: RateLimitConfig) -> Self {
        self.anonymous = Some(config);
        self
    }

    /// Thresholds for one endpoint class
    pub fn endpoint(mut self, class: EndpointClass, config: RateLimitConfig) -> Self {
        self.endpoints.insert(class, config);
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn outage_retry_after(mut self, retry_after: Duration) -> Self {
        self.outage_retry_after = retry_after;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Add a key that should bypass rate limiting
    pub fn bypass_key(mut self, key: impl Into<String>) -> Self {
        self.bypass_keys.push(key.into());
        self
    }

    /// Build and validate the settings
    pub fn build(self) -> RateLimitResult<RateLimitSettings> {
        let mut defaults = self
            .limits
            .unwrap_or_else(|| RateLimitConfig::defaults_for(self.environment));
        if let Some(fail_open) = self.fail_open {
            defaults.fail_open = fail_open;
        }

        let settings = RateLimitSettings {
            environment: self.environment,
            strategy: self.strategy,
            hybrid_enforcer: self.hybrid_enforcer,
            defaults,
            endpoints: self.endpoints,
            store_timeout: self.store_timeout,
            outage_retry_after: self.outage_retry_after,
            key_prefix: self.key_prefix,
            trust_forwarded_headers: self.trust_forwarded_headers,
            bypass_keys: self.bypass_keys,
            anonymous: self.anonymous,
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for RateLimitSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves [`RateLimitSettings`] from configuration sources.
#[derive(Clone)]
pub struct ConfigResolver {
    service: ConfigService,
}

impl ConfigResolver {
    /// `.env` plus `TOLLGATE_*` environment variables
    pub fn from_env() -> RateLimitResult<Self> {
        let service = ConfigService::builder()
            .with_prefix(ENV_PREFIX)
            .load_dotenv(None)
            .build()?;
        Ok(Self { service })
    }

    /// A configuration file overridden by `.env` and the environment
    pub fn with_file(path: impl Into<PathBuf>) -> RateLimitResult<Self> {
        let service = ConfigService::builder()
            .with_prefix(ENV_PREFIX)
            .add_file(path)?
            .load_dotenv(None)
            .build()?;
        Ok(Self { service })
    }

    pub fn from_service(service: ConfigService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ConfigService {
        &self.service
    }

    /// Resolve and validate the current settings
    pub fn resolve(&self) -> RateLimitResult<RateLimitSettings> {
        let environment = match self.service.get_opt::<String>("environment")? {
            Some(value) => Environment::parse(&value)?,
            None => Environment::default(),
        };
        let mut settings = RateLimitSettings::for_environment(environment);

        if let Some(value) = self.service.get_opt::<String>("migration_strategy")? {
            settings.strategy = MigrationStrategy::parse(&value)?;
        }
        if let Some(value) = self.service.get_opt::<String>("hybrid_enforcer")? {
            settings.hybrid_enforcer = match value.trim().to_ascii_lowercase().as_str() {
                "legacy" => Backend::Legacy,
                "distributed" => Backend::Distributed,
                other => {
                    return Err(RateLimitError::config(format!(
                        "unknown hybrid_enforcer {:?}, expected legacy or distributed",
                        other
                    )));
                }
            };
        }

        let top_level = LimitOverrides {
            per_second: self.threshold("per_second")?,
            per_minute: self.threshold("per_minute")?,
            per_hour: self.threshold("per_hour")?,
            burst: self.threshold("burst")?,
            burst_window_secs: self.threshold("burst_window_secs")?,
            fail_open: self.service.get_opt("fail_open")?,
        };
        settings.defaults = top_level.apply(&settings.defaults);

        if let Some(ms) = self.threshold("store_timeout_ms")? {
            settings.store_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.threshold("outage_retry_after_secs")? {
            settings.outage_retry_after = Duration::from_secs(secs);
        }
        if let Some(prefix) = self.service.get_opt::<String>("key_prefix")? {
            settings.key_prefix = prefix;
        }
        if let Some(trust) = self.service.get_opt("trust_forwarded_headers")? {
            settings.trust_forwarded_headers = trust;
        }
        if let Some(keys) = self.service.get_opt::<Vec<String>>("bypass_keys")? {
            settings.bypass_keys = keys;
        }

        if let Some(endpoints) = self
            .service
            .get_opt::<HashMap<String, LimitOverrides>>("endpoints")?
        {
            for (name, overrides) in endpoints {
                let config = overrides.apply(&settings.defaults);
                settings.endpoints.insert(EndpointClass::parse(&name), config);
            }
        }
        if let Some(overrides) = self.service.get_opt::<LimitOverrides>("anonymous")? {
            settings.anonymous = Some(overrides.apply(&settings.defaults));
        }

        settings.validate()?;

        debug!(
            environment = %settings.environment,
            strategy = %settings.strategy,
            per_second = settings.defaults.per_second,
            burst = settings.defaults.burst,
            fail_open = settings.defaults.fail_open,
            endpoints = settings.endpoints.len(),
            "Resolved rate limit settings"
        );

        Ok(settings)
    }

    /// Resolve, or fall back to [`RateLimitSettings::safe_defaults`].
    ///
    /// Rate limiting is never disabled: a broken configuration is replaced by
    /// strict production limits, failing closed.
    pub fn resolve_or_safe_defaults(&self) -> RateLimitSettings {
        match self.resolve() {
            Ok(settings) => settings,
            Err(err) => {
                error!(
                    error = %err,
                    "CRITICAL: invalid rate limit configuration, enforcing safe defaults"
                );
                RateLimitSettings::safe_defaults()
            }
        }
    }

    /// Re-read every source, then resolve.
    ///
    /// If the sources cannot be read, the previously loaded values are kept.
    pub fn reload(&self) -> RateLimitResult<RateLimitSettings> {
        self.service.reload()?;
        self.resolve()
    }

    /// Non-negative integer setting; zero and negatives are left to validation
    fn threshold(&self, key: &str) -> RateLimitResult<Option<u64>> {
        match self.service.get_opt::<i64>(key)? {
            Some(value) if value < 0 => Err(RateLimitError::config(format!(
                "{} must be a positive integer, got {}",
                key, value
            ))),
            Some(value) => Ok(Some(value.unsigned_abs())),
            None => Ok(None),
        }
    }
}
