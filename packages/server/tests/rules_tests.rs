//! Rules orchestration: dedupe enqueue, pipeline evaluation, alert-once
//! semantics, dry runs, event finalization.

mod common;

use common::fixtures::seed_site;
use common::TestHarness;
use server_core::common::EventId;
use server_core::domains::alert::AlertService;
use server_core::domains::event::Event;
use server_core::domains::rules::{
    unknown_domain_key, AlertOnceCache, DomainAllowlist, EnqueueRulesRequest, Ioc,
    PipelineContext, RulesError, RulesOrchestrator, RulesPipeline, Scope, SeenDomainsCache,
};
use server_core::domains::site::AlertMode;
use std::sync::Arc;
use test_context::test_context;
use uuid::Uuid;

fn pipeline(harness: &TestHarness) -> Arc<RulesPipeline> {
    let pool = harness.db_pool.clone();
    let alerts = Arc::new(AlertService::new(pool.clone()));
    Arc::new(RulesPipeline::new(
        pool.clone(),
        SeenDomainsCache::new(pool.clone(), harness.shared_cache.clone()),
        AlertOnceCache::new(harness.shared_cache.clone()),
        alerts,
    ))
}

fn orchestrator(harness: &TestHarness) -> Arc<RulesOrchestrator> {
    Arc::new(RulesOrchestrator::new(
        harness.db_pool.clone(),
        harness.job_repo(),
        pipeline(harness),
        harness.shared_cache.clone(),
    ))
}

async fn seed_network_event(harness: &TestHarness, url: &str) -> Event {
    Event::new(
        server_core::common::JobId::new(),
        "Network.requestWillBeSent",
        serde_json::json!({ "request": { "url": url } }),
    )
    .insert(&harness.db_pool)
    .await
    .expect("insert event")
}

async fn alert_count(harness: &TestHarness) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
        .fetch_one(&harness.db_pool)
        .await
        .unwrap()
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_wet_runs_alert_exactly_once(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let domain = format!("new-{}.example", Uuid::new_v4().simple());
    let url = format!("https://{domain}/checkout.js");

    let event_a = seed_network_event(harness, &url).await;
    let event_b = seed_network_event(harness, &url).await;

    let pipeline_a = pipeline(harness);
    let pipeline_b = pipeline(harness);
    let ctx = PipelineContext {
        site_id: site.id,
        scope: "checkout".to_string(),
        dry_run: false,
        alert_mode: AlertMode::Active,
        job_id: server_core::common::JobId::new(),
    };

    let (results_a, results_b) = tokio::join!(
        pipeline_a.run(std::slice::from_ref(&event_a), &ctx),
        pipeline_b.run(std::slice::from_ref(&event_b), &ctx),
    );

    assert_eq!(
        results_a.alerts_created + results_b.alerts_created,
        1,
        "alert-once dedupe allows exactly one alert"
    );
    assert_eq!(alert_count(harness).await, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn dry_run_previews_without_alerting_or_claiming(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let domain = format!("preview-{}.example", Uuid::new_v4().simple());
    let event = seed_network_event(harness, &format!("https://{domain}/x")).await;

    let orchestrator = orchestrator(harness);
    let job = orchestrator
        .enqueue_rules_processing_job(EnqueueRulesRequest {
            event_ids: vec![event.id],
            site_id: site.id,
            scope: "checkout".to_string(),
            priority: 0,
            is_test: true,
        })
        .await
        .expect("enqueue dry run");

    orchestrator.process_rules_job(&job).await.expect("process dry run");

    let results = orchestrator.get_job_results(job.id).await.unwrap();
    assert!(results.is_dry_run);
    assert_eq!(results.alerts_created, 0);
    assert_eq!(results.would_alert_unknown, vec![domain.clone()]);
    assert_eq!(alert_count(harness).await, 0, "dry run creates no alerts");

    // The alert-once key was only peeked, never claimed.
    let alert_once = AlertOnceCache::new(harness.shared_cache.clone());
    let scope = Scope::new(site.id, "checkout");
    assert!(!alert_once
        .peek(&scope, &unknown_domain_key(&domain))
        .await
        .unwrap());

    // Baselines are still established: the domain is now seen.
    let seen = SeenDomainsCache::new(harness.db_pool.clone(), harness.shared_cache.clone());
    assert!(seen.exists(&scope, &domain).await.unwrap());

    // Clean evaluation finalizes events, dry run or not.
    let refreshed = Event::find_by_ids(&[event.id], &harness.db_pool)
        .await
        .unwrap();
    assert!(refreshed[0].processed);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn batch_finalization_is_all_or_none(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let first = seed_network_event(
        harness,
        &format!("https://a-{}.example/x", Uuid::new_v4().simple()),
    )
    .await;
    let second = seed_network_event(
        harness,
        &format!("https://b-{}.example/x", Uuid::new_v4().simple()),
    )
    .await;

    let orchestrator = orchestrator(harness);
    let job = orchestrator
        .enqueue_rules_processing_job(EnqueueRulesRequest {
            event_ids: vec![first.id, second.id],
            site_id: site.id,
            scope: "landing".to_string(),
            priority: 0,
            is_test: false,
        })
        .await
        .unwrap();

    orchestrator.process_rules_job(&job).await.unwrap();

    let refreshed = Event::find_by_ids(&[first.id, second.id], &harness.db_pool)
        .await
        .unwrap();
    assert!(refreshed.iter().all(|e| e.processed), "whole batch finalized");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_enqueue_is_suppressed_within_ttl(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let event = seed_network_event(
        harness,
        &format!("https://c-{}.example/x", Uuid::new_v4().simple()),
    )
    .await;

    let orchestrator = orchestrator(harness);
    let request = EnqueueRulesRequest {
        event_ids: vec![event.id],
        site_id: site.id,
        scope: "landing".to_string(),
        priority: 0,
        is_test: false,
    };

    orchestrator
        .enqueue_rules_processing_job(request.clone())
        .await
        .expect("first enqueue");
    let second = orchestrator.enqueue_rules_processing_job(request).await;
    assert!(matches!(second, Err(RulesError::DuplicateEnqueue)));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn enqueue_validates_input(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let orchestrator = orchestrator(harness);

    let empty_ids = orchestrator
        .enqueue_rules_processing_job(EnqueueRulesRequest {
            event_ids: vec![],
            site_id: site.id,
            scope: "landing".to_string(),
            priority: 0,
            is_test: false,
        })
        .await;
    assert!(matches!(empty_ids, Err(RulesError::Invalid(_))));

    let empty_scope = orchestrator
        .enqueue_rules_processing_job(EnqueueRulesRequest {
            event_ids: vec![EventId::new()],
            site_id: site.id,
            scope: "  ".to_string(),
            priority: 0,
            is_test: false,
        })
        .await;
    assert!(matches!(empty_scope, Err(RulesError::Invalid(_))));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn zero_event_job_persists_an_empty_result(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let orchestrator = orchestrator(harness);

    let job = orchestrator
        .enqueue_rules_processing_job(EnqueueRulesRequest {
            event_ids: vec![EventId::new()],
            site_id: site.id,
            scope: "landing".to_string(),
            priority: 0,
            is_test: true,
        })
        .await
        .unwrap();

    orchestrator.process_rules_job(&job).await.unwrap();
    let results = orchestrator.get_job_results(job.id).await.unwrap();
    assert!(results.is_dry_run);
    assert_eq!(results.domains_processed, 0);
    assert_eq!(results.alerts_created, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn missing_results_are_a_typed_error(harness: &mut TestHarness) {
    let orchestrator = orchestrator(harness);
    let missing = orchestrator
        .get_job_results(server_core::common::JobId::new())
        .await;
    assert!(matches!(missing, Err(RulesError::ResultsNotFound)));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn allowlisted_domains_never_alert_but_seed_the_baseline(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let domain = format!("allowed-{}.example", Uuid::new_v4().simple());
    DomainAllowlist::for_site(site.id, domain.clone())
        .insert(&harness.db_pool)
        .await
        .unwrap();

    let event = seed_network_event(harness, &format!("https://{domain}/x")).await;
    let ctx = PipelineContext {
        site_id: site.id,
        scope: "landing".to_string(),
        dry_run: false,
        alert_mode: AlertMode::Active,
        job_id: server_core::common::JobId::new(),
    };

    let results = pipeline(harness).run(std::slice::from_ref(&event), &ctx).await;
    assert_eq!(results.alerts_created, 0);
    assert_eq!(results.unknown_domains, 0);
    assert_eq!(alert_count(harness).await, 0);

    let seen = SeenDomainsCache::new(harness.db_pool.clone(), harness.shared_cache.clone());
    let scope = Scope::new(site.id, "landing");
    assert!(seen.exists(&scope, &domain).await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn ioc_matches_raise_critical_alerts(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let domain = format!("exfil-{}.example", Uuid::new_v4().simple());
    Ioc::domain(domain.clone())
        .insert(&harness.db_pool)
        .await
        .unwrap();

    let event = seed_network_event(harness, &format!("https://{domain}/beacon")).await;
    let ctx = PipelineContext {
        site_id: site.id,
        scope: "landing".to_string(),
        dry_run: false,
        alert_mode: AlertMode::Active,
        job_id: server_core::common::JobId::new(),
    };

    let results = pipeline(harness).run(std::slice::from_ref(&event), &ctx).await;
    assert_eq!(results.ioc_host_matches, 1);
    // One unknown-domain alert plus one IOC alert.
    assert_eq!(results.alerts_created, 2);

    let severities: Vec<String> =
        sqlx::query_scalar("SELECT severity FROM alerts WHERE site_id = $1 ORDER BY severity")
            .bind(site.id)
            .fetch_all(&harness.db_pool)
            .await
            .unwrap();
    assert!(severities.contains(&"critical".to_string()));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unprocessable_events_are_skipped(harness: &mut TestHarness) {
    let site = seed_site(&harness.db_pool, None, AlertMode::Active).await;
    let event = Event::new(
        server_core::common::JobId::new(),
        "Page.loadEventFired",
        serde_json::json!({}),
    )
    .insert(&harness.db_pool)
    .await
    .unwrap();

    let ctx = PipelineContext {
        site_id: site.id,
        scope: "landing".to_string(),
        dry_run: false,
        alert_mode: AlertMode::Active,
        job_id: server_core::common::JobId::new(),
    };
    let results = pipeline(harness).run(std::slice::from_ref(&event), &ctx).await;
    assert_eq!(results.events_skipped, 1);
    assert_eq!(results.domains_processed, 0);
}
