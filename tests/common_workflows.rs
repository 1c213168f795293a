//! Integration tests for common Tollgate workflows.
//!
//! These tests wire the facade and middleware the way a service would.

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tollgate::prelude::*;

fn handler() -> Next {
    Box::new(
        |_req: Request<Bytes>| -> Pin<Box<dyn Future<Output = Response<Bytes>> + Send>> {
            Box::pin(async { Response::new(Bytes::from_static(b"ok")) })
        },
    )
}

fn api_request(user: &str) -> Request<Bytes> {
    Request::builder()
        .uri("/api/reports")
        .extension(CallerIdentity::new().with_organization("acme").with_user(user))
        .body(Bytes::new())
        .unwrap()
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_burst_then_recovery() {
    let settings = RateLimitSettings::builder()
        .environment(Environment::Staging)
        .strategy(MigrationStrategy::DistributedOnly)
        .build()
        .unwrap();
    let facade = MigrationFacade::builder(settings)
        .distributed_store(Arc::new(MemoryStore::new()))
        .build()
        .unwrap();
    let middleware = AdmissionMiddleware::new(Arc::new(facade));

    let mut statuses = Vec::new();
    for _ in 0..25 {
        let response = middleware.handle(api_request("alice"), handler()).await;
        statuses.push(response.status());
    }
    let admitted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    assert_eq!(admitted, 20);
    assert_eq!(statuses.len() - admitted, 5);

    tokio::time::advance(std::time::Duration::from_secs(1)).await;
    let response = middleware.handle(api_request("alice"), handler()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_denial_body_is_json() {
    let settings = RateLimitSettings::builder()
        .environment(Environment::Test)
        .limits(RateLimitConfig {
            per_second: 1,
            burst: 1,
            ..RateLimitConfig::default()
        })
        .build()
        .unwrap();
    let facade = MigrationFacade::builder(settings).build().unwrap();
    let middleware = AdmissionMiddleware::new(Arc::new(facade));

    middleware.handle(api_request("bob"), handler()).await;
    let response = middleware.handle(api_request("bob"), handler()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["code"], "rate_limited");
    assert!(body["retry_after"].as_u64().unwrap() >= 1);
}

// =============================================================================
// Migration
// =============================================================================

#[tokio::test]
async fn test_staged_rollout() {
    let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
    let base = RateLimitSettings::builder()
        .environment(Environment::Production)
        .build()
        .unwrap();
    let facade = Arc::new(
        MigrationFacade::builder(base.clone())
            .distributed_store(store)
            .build()
            .unwrap(),
    );
    let middleware = AdmissionMiddleware::new(Arc::clone(&facade));

    for strategy in [
        MigrationStrategy::Legacy,
        MigrationStrategy::Hybrid,
        MigrationStrategy::DistributedOnly,
    ] {
        let mut settings = base.clone();
        settings.strategy = strategy;
        facade.reload(settings).unwrap();

        let outcome = middleware.check(&api_request("carol")).await;
        assert!(outcome.is_allowed());
        assert_eq!(facade.status().await.migration_strategy, strategy);
    }

    facade.rollback().unwrap();
    let outcome = middleware.check(&api_request("carol")).await;
    assert_eq!(outcome.decision().unwrap().backend, Backend::Legacy);
}

#[test]
fn test_production_rejects_fail_open() {
    let result = RateLimitSettings::builder()
        .environment(Environment::Production)
        .fail_open(true)
        .build();
    assert!(matches!(result, Err(RateLimitError::ConfigInvalid(_))));
}
