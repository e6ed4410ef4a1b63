//! Alert creation, mute semantics, and asynchronous dispatch.

mod common;

use common::fixtures::{seed_sink, seed_site};
use common::TestHarness;
use server_core::domains::alert::{
    AlertDispatcher, AlertService, CreateAlertRequest, DeliveryStatus, DispatchError,
};
use server_core::domains::site::AlertMode;
use server_core::kernel::jobs::{Job, JobStatus, JobType};
use std::sync::Arc;
use std::time::Duration;
use test_context::test_context;

fn service_with_dispatch(harness: &TestHarness) -> AlertService {
    let dispatcher = Arc::new(
        AlertDispatcher::new(harness.db_pool.clone(), "http://localhost:8080")
            .with_sink_scheduler(harness.job_repo()),
    );
    AlertService::new(harness.db_pool.clone()).with_dispatcher(dispatcher)
}

fn alert_request(site_id: server_core::common::SiteId) -> CreateAlertRequest {
    CreateAlertRequest::builder()
        .site_id(site_id)
        .rule_type("unknown-domain")
        .severity("medium")
        .title("Unknown domain observed: evil.example")
        .build()
}

async fn alert_jobs(harness: &TestHarness) -> Vec<Job> {
    sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_type = 'alert'")
        .fetch_all(&harness.db_pool)
        .await
        .unwrap()
}

/// Poll until the detached dispatch task has enqueued its job.
async fn wait_for_alert_jobs(harness: &TestHarness) -> Vec<Job> {
    for _ in 0..60 {
        let jobs = alert_jobs(harness).await;
        if !jobs.is_empty() {
            return jobs;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Vec::new()
}

#[test_context(TestHarness)]
#[tokio::test]
async fn create_schedules_one_delivery_job_per_sink(harness: &mut TestHarness) {
    let sink = seed_sink(&harness.db_pool, 3).await;
    let site = seed_site(&harness.db_pool, Some(sink.id), AlertMode::Active).await;

    let alert = service_with_dispatch(harness)
        .create(alert_request(site.id))
        .await
        .expect("create alert");
    assert_eq!(alert.delivery_status, DeliveryStatus::Pending);

    let jobs = wait_for_alert_jobs(harness).await;
    assert_eq!(jobs.len(), 1, "exactly one delivery job within the window");
    let job = &jobs[0];
    assert_eq!(job.job_type, JobType::Alert);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.max_retries, 3, "sink retry becomes job max_retries");

    assert_eq!(job.payload["sink_id"], serde_json::json!(sink.id));
    let payload = &job.payload["payload"];
    assert_eq!(payload["site_name"], serde_json::json!(site.name));
    assert_eq!(
        payload["alert_url"],
        serde_json::json!(format!("http://localhost:8080/alerts/{}", alert.id))
    );
    assert_eq!(payload["alert"]["id"], serde_json::json!(alert.id));
    assert_eq!(payload["alert"]["title"], serde_json::json!(alert.title));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn muted_site_records_alert_without_dispatch(harness: &mut TestHarness) {
    let sink = seed_sink(&harness.db_pool, 3).await;
    let site = seed_site(&harness.db_pool, Some(sink.id), AlertMode::Muted).await;

    let alert = service_with_dispatch(harness)
        .create(alert_request(site.id))
        .await
        .unwrap();
    assert_eq!(alert.delivery_status, DeliveryStatus::Muted);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(alert_jobs(harness).await.is_empty(), "muted alerts never dispatch");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn site_without_sink_skips_silently(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let service = service_with_dispatch(harness);

    let alert = service.create(alert_request(site.id)).await.unwrap();
    assert_eq!(alert.delivery_status, DeliveryStatus::Pending);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(alert_jobs(harness).await.is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn dispatcher_without_scheduler_is_a_typed_error(harness: &mut TestHarness) {
    let sink = seed_sink(&harness.db_pool, 1).await;
    let site = seed_site(&harness.db_pool, Some(sink.id), AlertMode::Active).await;

    let alert = AlertService::new(harness.db_pool.clone())
        .create(alert_request(site.id))
        .await
        .unwrap();

    let bare = AlertDispatcher::new(harness.db_pool.clone(), "http://localhost:8080");
    let result = bare.dispatch(&alert).await;
    assert!(matches!(
        result,
        Err(DispatchError::SinkSchedulerNotConfigured)
    ));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn resolve_and_stats_round_trip(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let service = AlertService::new(harness.db_pool.clone());

    let alert = service.create(alert_request(site.id)).await.unwrap();

    let stats = service.stats(Some(site.id)).await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.unresolved, 1);

    let resolved = service
        .resolve(alert.id, "analyst@example.com")
        .await
        .unwrap()
        .expect("alert resolves");
    assert!(resolved.resolved_at.is_some());
    assert_eq!(resolved.resolved_by.as_deref(), Some("analyst@example.com"));

    // Resolving twice is a no-op.
    assert!(service
        .resolve(alert.id, "someone-else")
        .await
        .unwrap()
        .is_none());

    let stats = service.stats(Some(site.id)).await.unwrap();
    assert_eq!(stats.unresolved, 0);
}
