//! Webhook intake: events become pending selective pull jobs, bursts
//! collapse into one job, suppressed configs drop events, and the worker
//! picks the job up end to end.

mod support;

use chrono::Duration;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use support::{Harness, VENDOR};
use vendorsync::models::record::EntityType;
use vendorsync::models::sync_job::{JobStatus, SyncDirection, SyncMode};
use vendorsync::webhooks::WebhookEvent;

fn tenant_event(harness: &Harness, entity_id: &str) -> WebhookEvent {
    WebhookEvent {
        organization_id: harness.organization_id,
        vendor: VENDOR.into(),
        event_type: "tenant.updated".into(),
        entity_type: EntityType::Tenant,
        entity_id: entity_id.into(),
        payload: json!({"id": entity_id}),
    }
}

#[tokio::test]
async fn events_enqueue_one_selective_pull_per_record() {
    let harness = Harness::new().await;
    harness.seed_connection(Duration::hours(1)).await;

    let job = harness
        .webhooks
        .ingest(tenant_event(&harness, "v-7"))
        .await
        .expect("ingest")
        .expect("job enqueued");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.direction, SyncDirection::Pull);
    assert_eq!(job.mode, SyncMode::Selective);
    assert_eq!(job.selective_ids, vec!["v-7".to_string()]);

    // A burst of events for the same record collapses into the queued job.
    let duplicate = harness
        .webhooks
        .ingest(tenant_event(&harness, "v-7"))
        .await
        .expect("ingest");
    assert!(duplicate.is_none());

    // A different record still gets its own job.
    let other = harness
        .webhooks
        .ingest(tenant_event(&harness, "v-8"))
        .await
        .expect("ingest");
    assert!(other.is_some());
}

#[tokio::test]
async fn suppressed_configurations_drop_events() {
    let harness = Harness::new().await;
    harness.seed_connection(Duration::hours(1)).await;

    harness.set_org_config(|config| {
        config.auto_sync = false;
    });
    let job = harness
        .webhooks
        .ingest(tenant_event(&harness, "v-7"))
        .await
        .expect("ingest");
    assert!(job.is_none(), "auto_sync off ignores webhooks");

    harness.set_org_config(|config| {
        config.enabled_entity_types = vec![EntityType::Payment];
    });
    let job = harness
        .webhooks
        .ingest(tenant_event(&harness, "v-7"))
        .await
        .expect("ingest");
    assert!(job.is_none(), "disabled entity types ignore webhooks");
}

#[tokio::test]
async fn events_without_an_active_connection_are_dropped() {
    let harness = Harness::new().await;

    let job = harness
        .webhooks
        .ingest(tenant_event(&harness, "v-7"))
        .await
        .expect("ingest");
    assert!(job.is_none());
}

#[tokio::test]
async fn the_worker_claims_webhook_jobs_and_pulls_the_record() {
    let harness = Harness::new().await;
    harness.seed_connection(Duration::hours(1)).await;

    Mock::given(method("GET"))
        .and(path("/v1/tenants/v-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "v-7",
            "email": "webhook@example.com",
            "name": "Webhook Tenant",
            "updated_at": chrono::Utc::now().to_rfc3339(),
        })))
        .expect(1)
        .mount(&harness.server)
        .await;

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(
        harness
            .orchestrator
            .clone()
            .run_worker(shutdown.clone()),
    );

    let job = harness
        .webhooks
        .ingest(tenant_event(&harness, "v-7"))
        .await
        .expect("ingest")
        .expect("job enqueued");

    // Wait for the worker to claim and finish the job.
    let mut finished = None;
    for _ in 0..40 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let current = harness
            .stores
            .jobs
            .get(job.id)
            .await
            .expect("get job")
            .expect("job exists");
        if current.status.is_terminal() {
            finished = Some(current);
            break;
        }
    }
    shutdown.cancel();
    worker.await.expect("worker task");

    let finished = finished.expect("job finished within the deadline");
    assert_eq!(finished.status, JobStatus::Completed);

    let record = harness
        .stores
        .records
        .find_by_field(
            harness.organization_id,
            EntityType::Tenant,
            "vendor_id",
            &Value::String("v-7".into()),
        )
        .await
        .expect("find")
        .expect("record pulled");
    assert_eq!(record["email"], json!("webhook@example.com"));
}
