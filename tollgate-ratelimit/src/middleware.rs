//! Admission middleware
//!
//! Runs before business handlers: derives the bucket key from the caller
//! identity placed in request extensions by the authentication layer,
//! evaluates it through the [`MigrationFacade`], attaches rate limit headers
//! to every response and short-circuits denied requests with `429`.
//!
//! An unavailable backend never reaches the protected handler as an error:
//! it is turned into the configured outage policy. Fail-closed denials carry
//! the code `rate_limiter_unavailable`, quota denials `rate_limited`.
//!
//! Bypass keys are not evaluated; their responses still carry the header
//! set, with `X-RateLimit-Backend: bypass` and the full quota.

use crate::config::RateLimitSettings;
use crate::decision::RateLimitDecision;
use crate::error::RateLimitHeaders;
use crate::facade::MigrationFacade;
use crate::key::{CallerIdentity, EndpointClassifier, PeerAddr, RateLimitKey, resolve_client_ip};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Type alias for the next handler in the middleware chain
pub type Next = Box<
    dyn FnOnce(Request<Bytes>) -> Pin<Box<dyn Future<Output = Response<Bytes>> + Send>> + Send,
>;

/// Middleware trait for processing requests before they reach the handler
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request and optionally pass to next middleware
    async fn handle(&self, req: Request<Bytes>, next: Next) -> Response<Bytes>;
}

/// Why a request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The caller's quota is used up
    QuotaExhausted,
    /// No backend could decide and the policy is fail-closed
    BackendUnavailable,
}

impl DenyReason {
    /// Machine-readable code in the response body
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExhausted => "rate_limited",
            Self::BackendUnavailable => "rate_limiter_unavailable",
        }
    }
}

/// Result of the admission check
#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    /// Request proceeds
    Allowed {
        /// `None` for bypass keys, which are not evaluated
        decision: Option<RateLimitDecision>,
        /// Always set by [`AdmissionMiddleware::check`]
        headers: Option<RateLimitHeaders>,
    },
    /// Request is rejected
    Denied {
        decision: RateLimitDecision,
        headers: RateLimitHeaders,
        reason: DenyReason,
        message: String,
    },
}

impl AdmissionOutcome {
    /// Check if the request is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Get the headers if any
    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            Self::Allowed { headers, .. } => headers.as_ref(),
            Self::Denied { headers, .. } => Some(headers),
        }
    }

    /// Get the decision if the request was evaluated
    pub fn decision(&self) -> Option<&RateLimitDecision> {
        match self {
            Self::Allowed { decision, .. } => decision.as_ref(),
            Self::Denied { decision, .. } => Some(decision),
        }
    }

    /// Get the deny reason if denied
    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            Self::Denied { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Rate limiting middleware
pub struct AdmissionMiddleware {
    facade: Arc<MigrationFacade>,
    classifier: EndpointClassifier,
    health_path: Option<String>,
    quota_message: String,
    outage_message: String,
}

impl AdmissionMiddleware {
    pub fn new(facade: Arc<MigrationFacade>) -> Self {
        Self {
            facade,
            classifier: EndpointClassifier::default(),
            health_path: None,
            quota_message: "Rate limit exceeded".to_string(),
            outage_message: "Rate limiting is temporarily unavailable; request rejected"
                .to_string(),
        }
    }

    /// Set the endpoint classifier
    pub fn with_classifier(mut self, classifier: EndpointClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Answer `path` with the facade's health payload
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = Some(path.into());
        self
    }

    /// Set message for quota denials
    pub fn with_quota_message(mut self, message: impl Into<String>) -> Self {
        self.quota_message = message.into();
        self
    }

    /// Set message for fail-closed denials
    pub fn with_outage_message(mut self, message: impl Into<String>) -> Self {
        self.outage_message = message.into();
        self
    }

    pub fn facade(&self) -> &Arc<MigrationFacade> {
        &self.facade
    }

    /// Derive the bucket key of a request
    pub fn derive_key(&self, req: &Request<Bytes>, settings: &RateLimitSettings) -> RateLimitKey {
        let mut identity = req
            .extensions()
            .get::<CallerIdentity>()
            .cloned()
            .unwrap_or_default();

        if identity.client_ip.is_none() {
            let peer = req.extensions().get::<PeerAddr>().map(|p| p.0.ip());
            identity.client_ip =
                resolve_client_ip(req.headers(), peer, settings.trust_forwarded_headers);
        }

        let class = self.classifier.classify(req.uri().path());
        RateLimitKey::derive_or_anonymous(&identity, &class)
    }

    /// Decide on a request without running the handler
    pub async fn check(&self, req: &Request<Bytes>) -> AdmissionOutcome {
        let snapshot = self.facade.snapshot();
        let settings = &snapshot.settings;
        let key = self.derive_key(req, settings);

        if settings.should_bypass(key.as_str()) {
            debug!(key = %key, "Key is in bypass list, allowing request");
            return AdmissionOutcome::Allowed {
                decision: None,
                headers: Some(RateLimitHeaders::bypass(settings.config_for_key(&key))),
            };
        }

        trace!(key = %key, strategy = %settings.strategy, "Checking rate limit");

        let config = settings.config_for_key(&key);
        let decision = match snapshot.limiter.evaluate(&key, config).await {
            Ok(decision) => decision,
            Err(err) => {
                let decision = RateLimitDecision::unavailable(
                    config.fail_open,
                    config.burst,
                    settings.outage_retry_after,
                );
                if decision.allowed {
                    warn!(key = %key, error = %err, "Rate limit backend unavailable, failing open");
                } else {
                    error!(key = %key, error = %err, "Rate limit backend unavailable, failing closed");
                }
                decision
            }
        };

        if let Some(metrics) = self.facade.metrics() {
            metrics.record_decision(&decision);
        }

        let headers = RateLimitHeaders::from_decision(&decision);
        if decision.allowed {
            return AdmissionOutcome::Allowed {
                decision: Some(decision),
                headers: Some(headers),
            };
        }

        let (reason, message) = if decision.is_outage() {
            (DenyReason::BackendUnavailable, self.outage_message.clone())
        } else {
            (DenyReason::QuotaExhausted, self.quota_message.clone())
        };

        AdmissionOutcome::Denied {
            decision,
            headers,
            reason,
            message,
        }
    }

    async fn health_response(&self) -> Response<Bytes> {
        let status = self.facade.status().await;
        let code = if status.backend_reachable || !status.distributed_enabled {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        match serde_json::to_vec(&status) {
            Ok(body) => json_response(code, body),
            Err(err) => {
                error!(error = %err, "Failed to serialize health status");
                let mut response = Response::new(Bytes::new());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

#[async_trait]
impl Middleware for AdmissionMiddleware {
    async fn handle(&self, req: Request<Bytes>, next: Next) -> Response<Bytes> {
        if let Some(path) = &self.health_path
            && req.uri().path() == path.as_str()
        {
            return self.health_response().await;
        }

        match self.check(&req).await {
            AdmissionOutcome::Allowed { headers, .. } => {
                let mut response = next(req).await;
                if let Some(headers) = headers {
                    apply_headers(&mut response, &headers);
                }
                response
            }
            AdmissionOutcome::Denied {
                headers,
                reason,
                message,
                ..
            } => throttled_response(&headers, reason, &message),
        }
    }
}

/// Build the `429` response for a denied request
pub fn throttled_response(
    headers: &RateLimitHeaders,
    reason: DenyReason,
    message: &str,
) -> Response<Bytes> {
    let body = serde_json::json!({
        "error": "Too Many Requests",
        "code": reason.code(),
        "message": message,
        "retry_after": headers.retry_after,
    });

    let mut response = json_response(StatusCode::TOO_MANY_REQUESTS, body.to_string().into_bytes());
    apply_headers(&mut response, headers);
    response
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn apply_headers(response: &mut Response<Bytes>, headers: &RateLimitHeaders) {
    for (name, value) in headers.to_header_pairs() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environment, MigrationStrategy, RateLimitConfig};
    use crate::decision::Backend;
    use crate::error::{RateLimitError, RateLimitResult};
    use crate::stores::{CounterStore, PlanOutcome};
    use crate::window::WindowPlan;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn check_and_increment(
            &self,
            _bucket: &str,
            _plan: &WindowPlan,
        ) -> RateLimitResult<PlanOutcome> {
            Err(RateLimitError::store("connection refused"))
        }

        async fn reset(&self, _bucket: &str) -> RateLimitResult<()> {
            Err(RateLimitError::store("connection refused"))
        }

        async fn ping(&self) -> RateLimitResult<()> {
            Err(RateLimitError::store("connection refused"))
        }

        fn store_type(&self) -> &'static str {
            "down"
        }
    }

    fn ok_next() -> Next {
        Box::new(
            |_req: Request<Bytes>| -> Pin<Box<dyn Future<Output = Response<Bytes>> + Send>> {
                Box::pin(async { Response::new(Bytes::from_static(b"ok")) })
            },
        )
    }

    fn request(path: &str, identity: CallerIdentity) -> Request<Bytes> {
        Request::builder()
            .uri(path)
            .extension(identity)
            .body(Bytes::new())
            .unwrap()
    }

    fn middleware(settings: RateLimitSettings, store: Option<Arc<dyn CounterStore>>) -> AdmissionMiddleware {
        let mut builder = MigrationFacade::builder(settings);
        if let Some(store) = store {
            builder = builder.distributed_store(store);
        }
        AdmissionMiddleware::new(Arc::new(builder.build().unwrap()))
    }

    fn small_limits() -> RateLimitConfig {
        RateLimitConfig {
            per_second: 2,
            per_minute: 10,
            per_hour: 100,
            burst: 2,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_allowed_request_gets_headers() {
        let settings = RateLimitSettings::builder()
            .environment(Environment::Test)
            .build()
            .unwrap();
        let mw = middleware(settings, None);

        let response = mw
            .handle(request("/api/users", CallerIdentity::new().with_user("u1")), ok_next())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"ok"));
        assert_eq!(response.headers()["x-ratelimit-limit"], "20");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "19");
        assert_eq!(response.headers()["x-ratelimit-backend"], "legacy");
        assert_eq!(response.headers()["x-ratelimit-policy"], "second");
    }

    #[tokio::test]
    async fn test_quota_denial() {
        let settings = RateLimitSettings::builder()
            .environment(Environment::Test)
            .limits(small_limits())
            .build()
            .unwrap();
        let mw = middleware(settings, None);
        let identity = CallerIdentity::new().with_user("u1");

        for _ in 0..2 {
            let response = mw.handle(request("/api", identity.clone()), ok_next()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = mw.handle(request("/api", identity), ok_next()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "1");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["code"], "rate_limited");
        assert_eq!(body["retry_after"], 1);
    }

    #[tokio::test]
    async fn test_anonymous_callers_get_anonymous_limits() {
        let settings = RateLimitSettings::builder()
            .environment(Environment::Test)
            .limits(small_limits())
            .anonymous_limits(RateLimitConfig {
                per_second: 1,
                per_minute: 5,
                per_hour: 50,
                burst: 1,
                ..RateLimitConfig::default()
            })
            .build()
            .unwrap();
        let mw = middleware(settings, None);

        let response = mw.handle(request("/api", CallerIdentity::new()), ok_next()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "1");

        let response = mw.handle(request("/api", CallerIdentity::new()), ok_next()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let identity = CallerIdentity::new().with_user("u1");
        let response = mw.handle(request("/api", identity), ok_next()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
    }

    #[tokio::test]
    async fn test_fail_closed_has_distinct_code() {
        let settings = RateLimitSettings::builder()
            .environment(Environment::Production)
            .strategy(MigrationStrategy::DistributedOnly)
            .build()
            .unwrap();
        let mw = middleware(settings, Some(Arc::new(DownStore)));

        let outcome = mw
            .check(&request("/api", CallerIdentity::new().with_user("u1")))
            .await;
        assert_eq!(outcome.reason(), Some(DenyReason::BackendUnavailable));
        assert_eq!(outcome.decision().unwrap().backend, Backend::Unavailable);

        let response = mw
            .handle(request("/api", CallerIdentity::new().with_user("u1")), ok_next())
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "5");
        assert_eq!(response.headers()["x-ratelimit-backend"], "unavailable");
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["code"], "rate_limiter_unavailable");
    }

    #[tokio::test]
    async fn test_fail_open_admits() {
        let settings = RateLimitSettings::builder()
            .environment(Environment::Staging)
            .strategy(MigrationStrategy::DistributedOnly)
            .fail_open(true)
            .build()
            .unwrap();
        let mw = middleware(settings, Some(Arc::new(DownStore)));

        let response = mw
            .handle(request("/api", CallerIdentity::new().with_user("u1")), ok_next())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-backend"], "unavailable");
        assert_eq!(response.headers()["x-ratelimit-policy"], "none");
    }

    #[tokio::test]
    async fn test_peer_and_forwarded_ip_keys() {
        let settings = RateLimitSettings::builder()
            .environment(Environment::Test)
            .build()
            .unwrap();
        let mw = middleware(settings.clone(), None);

        let mut req = Request::builder()
            .uri("/webhooks/stripe")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Bytes::new())
            .unwrap();
        req.extensions_mut().insert(PeerAddr(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            40000,
        )));
        assert_eq!(
            mw.derive_key(&req, &settings).as_str(),
            "org::ip:203.0.113.9:webhook"
        );

        let anonymous = Request::builder().uri("/media/x").body(Bytes::new()).unwrap();
        assert_eq!(mw.derive_key(&anonymous, &settings).as_str(), "anon:media");
    }

    #[tokio::test]
    async fn test_bypass_keys() {
        let settings = RateLimitSettings::builder()
            .environment(Environment::Test)
            .limits(small_limits())
            .bypass_key("org:internal:user:cron:api")
            .build()
            .unwrap();
        let mw = middleware(settings, None);
        let identity = CallerIdentity::new()
            .with_organization("internal")
            .with_user("cron");

        for _ in 0..5 {
            let outcome = mw.check(&request("/api", identity.clone())).await;
            assert!(outcome.is_allowed());
            assert!(outcome.decision().is_none());
            assert_eq!(outcome.headers().unwrap().backend, "bypass");
        }

        let response = mw.handle(request("/api", identity), ok_next()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-backend"], "bypass");
        assert_eq!(
            response.headers()["x-ratelimit-limit"],
            small_limits().burst.to_string().as_str()
        );
    }

    #[tokio::test]
    async fn test_health_path() {
        let settings = RateLimitSettings::builder()
            .environment(Environment::Test)
            .build()
            .unwrap();
        let mw = middleware(settings, None).with_health_path("/health/ratelimit");

        let response = mw
            .handle(request("/health/ratelimit", CallerIdentity::new()), ok_next())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["migration_strategy"], "legacy");
        assert_eq!(body["backend_reachable"], true);
        assert_eq!(body["fail_open_configured"], false);
    }
}
