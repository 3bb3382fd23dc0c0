//! Resilient client behavior against a mock vendor: retry/backoff on
//! transient failures, hard stop on auth failures, Retry-After compliance,
//! pre-flight rate-limit gating, and the read cache.

mod support;

use std::time::Instant;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use support::Harness;
use vendorsync::client::RequestDescriptor;
use vendorsync::error::Error;
use vendorsync::models::connection::RateLimitSnapshot;
use vendorsync::models::record::EntityType;

#[tokio::test]
async fn transient_5xx_retries_with_backoff_until_success() {
    let harness = Harness::new().await;
    let connection = harness.seed_connection(Duration::hours(1)).await;

    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .and(header("Authorization", "Bearer access-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "t-1"})))
        .expect(1)
        .mount(&harness.server)
        .await;

    let envelope = harness
        .client
        .execute(
            connection.id,
            &RequestDescriptor::get(EntityType::Tenant, "t-1"),
            &CancellationToken::new(),
        )
        .await
        .expect("succeeds after retries");
    assert!(envelope.success);
    assert_eq!(envelope.payload["id"], json!("t-1"));
}

#[tokio::test]
async fn transient_failures_exhaust_the_retry_budget() {
    let harness = Harness::new().await;
    let connection = harness.seed_connection(Duration::hours(1)).await;

    // max_retries = 3, so 4 requests total.
    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&harness.server)
        .await;

    let err = harness
        .client
        .execute(
            connection.id,
            &RequestDescriptor::get(EntityType::Tenant, "t-1"),
            &CancellationToken::new(),
        )
        .await
        .expect_err("retries exhausted");
    assert!(matches!(err, Error::Transient(_)));
}

#[tokio::test]
async fn per_org_retry_cap_overrides_the_global_policy() {
    let harness = Harness::new().await;
    let connection = harness.seed_connection(Duration::hours(1)).await;
    harness.set_org_config(|config| {
        config.max_retries = Some(0);
    });

    // The global policy would retry three times; this organization allows
    // none, so exactly one request goes out.
    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&harness.server)
        .await;

    let err = harness
        .client
        .execute(
            connection.id,
            &RequestDescriptor::get(EntityType::Tenant, "t-1"),
            &CancellationToken::new(),
        )
        .await
        .expect_err("no retries allowed");
    assert!(matches!(err, Error::Transient(_)));
}

#[tokio::test]
async fn auth_failures_are_never_retried() {
    let harness = Harness::new().await;
    let connection = harness.seed_connection(Duration::hours(1)).await;

    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&harness.server)
        .await;

    let err = harness
        .client
        .execute(
            connection.id,
            &RequestDescriptor::get(EntityType::Tenant, "t-1"),
            &CancellationToken::new(),
        )
        .await
        .expect_err("auth failure");
    assert!(matches!(err, Error::Auth(_)));
}

#[tokio::test]
async fn retry_after_is_honored_without_consuming_retries() {
    let harness = Harness::new().await;
    let connection = harness.seed_connection(Duration::hours(1)).await;

    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "1"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "t-1"})))
        .expect(1)
        .mount(&harness.server)
        .await;

    let started = Instant::now();
    let envelope = harness
        .client
        .execute(
            connection.id,
            &RequestDescriptor::get(EntityType::Tenant, "t-1"),
            &CancellationToken::new(),
        )
        .await
        .expect("succeeds after the wait");
    assert!(envelope.success);
    assert!(
        started.elapsed().as_millis() >= 950,
        "waited {}ms, expected ~1s",
        started.elapsed().as_millis()
    );
}

#[tokio::test]
async fn exhausted_budget_suspends_calls_until_reset() {
    let harness = Harness::new().await;
    let mut connection = harness.seed_connection(Duration::hours(1)).await;

    connection.rate_limit = RateLimitSnapshot {
        limit: Some(100),
        remaining: Some(0),
        reset_at: Some(Utc::now() + Duration::seconds(1)),
    };
    harness
        .stores
        .connections
        .update(connection.clone())
        .await
        .expect("update");

    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "t-1"})))
        .expect(1)
        .mount(&harness.server)
        .await;

    let started = Instant::now();
    let envelope = harness
        .client
        .execute(
            connection.id,
            &RequestDescriptor::get(EntityType::Tenant, "t-1"),
            &CancellationToken::new(),
        )
        .await
        .expect("succeeds after the reset");
    assert!(envelope.success);
    assert!(
        started.elapsed().as_millis() >= 900,
        "waited {}ms, expected ~1s",
        started.elapsed().as_millis()
    );
}

#[tokio::test]
async fn org_rate_limit_reserve_counts_as_exhausted() {
    let harness = Harness::new().await;
    let mut connection = harness.seed_connection(Duration::hours(1)).await;

    harness.set_org_config(|config| {
        config.rate_limit_reserve = 10;
    });

    // 7 remaining is below the reserve of 10, so the call waits for the
    // reset even though the vendor budget is not strictly empty.
    connection.rate_limit = RateLimitSnapshot {
        limit: Some(100),
        remaining: Some(7),
        reset_at: Some(Utc::now() + Duration::seconds(1)),
    };
    harness
        .stores
        .connections
        .update(connection.clone())
        .await
        .expect("update");

    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "t-1"})))
        .expect(1)
        .mount(&harness.server)
        .await;

    let started = Instant::now();
    let envelope = harness
        .client
        .execute(
            connection.id,
            &RequestDescriptor::get(EntityType::Tenant, "t-1"),
            &CancellationToken::new(),
        )
        .await
        .expect("succeeds after the reset");
    assert!(envelope.success);
    assert!(
        started.elapsed().as_millis() >= 900,
        "waited {}ms, expected ~1s",
        started.elapsed().as_millis()
    );
}

#[tokio::test]
async fn reads_are_cached_and_writes_invalidate() {
    let harness = Harness::new().await;
    let connection = harness.seed_connection(Duration::hours(1)).await;

    Mock::given(method("GET"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "t-1"})))
        .expect(2)
        .mount(&harness.server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/tenants/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "t-1"})))
        .expect(1)
        .mount(&harness.server)
        .await;

    let cancel = CancellationToken::new();
    let descriptor = RequestDescriptor::get(EntityType::Tenant, "t-1");

    // Two reads, one request: the second is served from cache.
    harness
        .client
        .execute(connection.id, &descriptor, &cancel)
        .await
        .expect("first read");
    harness
        .client
        .execute(connection.id, &descriptor, &cancel)
        .await
        .expect("cached read");

    // A write invalidates; the next read goes back to the vendor.
    harness
        .client
        .execute(
            connection.id,
            &RequestDescriptor::update(EntityType::Tenant, "t-1", json!({"name": "Ada"})),
            &cancel,
        )
        .await
        .expect("write");
    harness
        .client
        .execute(connection.id, &descriptor, &cancel)
        .await
        .expect("read after invalidation");
}
