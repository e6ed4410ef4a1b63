//! Generic job worker: claim, execute, terminal transitions.

mod common;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use common::TestHarness;
use server_core::kernel::jobs::{
    EnqueueResult, Job, JobHandler, JobRegistry, JobRepo, JobStatus, JobType, JobWorker,
};
use server_core::kernel::ServerDeps;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use test_context::test_context;

struct CountingHandler {
    executed: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn execute(&self, _job: &Job, _deps: Arc<ServerDeps>) -> Result<()> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("handler exploded"));
        }
        Ok(())
    }
}

fn worker_with(
    harness: &TestHarness,
    handler: CountingHandler,
) -> (JobWorker, Arc<dyn JobRepo>) {
    let repo: Arc<dyn JobRepo> = harness.job_repo();
    let registry = Arc::new(JobRegistry::new().register(JobType::Rules, Arc::new(handler)));
    let deps = Arc::new(ServerDeps::for_tests(harness.db_pool.clone()));
    (JobWorker::new(repo.clone(), registry, deps), repo)
}

#[test_context(TestHarness)]
#[tokio::test]
async fn worker_completes_successful_jobs(harness: &mut TestHarness) {
    let executed = Arc::new(AtomicUsize::new(0));
    let (worker, repo) = worker_with(
        harness,
        CountingHandler {
            executed: executed.clone(),
            fail: false,
        },
    );

    let EnqueueResult::Created(job) = repo
        .create(Job::builder().job_type(JobType::Rules).build())
        .await
        .unwrap()
    else {
        panic!("expected created job");
    };

    assert_eq!(worker.drain_once().await, 1);
    assert_eq!(executed.load(Ordering::SeqCst), 1);

    let done = Job::find_by_id(job.id, &harness.db_pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.lease_expires_at.is_none());

    // Nothing left to drain.
    assert_eq!(worker.drain_once().await, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn worker_failures_rearm_until_exhausted(harness: &mut TestHarness) {
    let executed = Arc::new(AtomicUsize::new(0));
    let (worker, repo) = worker_with(
        harness,
        CountingHandler {
            executed: executed.clone(),
            fail: true,
        },
    );

    let EnqueueResult::Created(job) = repo
        .create(
            Job::builder()
                .job_type(JobType::Rules)
                .max_retries(1)
                .build(),
        )
        .await
        .unwrap()
    else {
        panic!("expected created job");
    };

    assert_eq!(worker.drain_once().await, 1);
    let rearmed = Job::find_by_id(job.id, &harness.db_pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rearmed.status, JobStatus::Pending);
    assert_eq!(rearmed.retry_count, 1);

    assert_eq!(worker.drain_once().await, 1);
    let failed = Job::find_by_id(job.id, &harness.db_pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("handler exploded"));

    assert_eq!(executed.load(Ordering::SeqCst), 2);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn worker_only_claims_registered_types(harness: &mut TestHarness) {
    let executed = Arc::new(AtomicUsize::new(0));
    let (worker, repo) = worker_with(
        harness,
        CountingHandler {
            executed: executed.clone(),
            fail: false,
        },
    );

    // Browser jobs belong to the external browser worker.
    let EnqueueResult::Created(job) = repo
        .create(Job::builder().job_type(JobType::Browser).build())
        .await
        .unwrap()
    else {
        panic!("expected created job");
    };

    assert_eq!(worker.drain_once().await, 0);
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    let untouched = Job::find_by_id(job.id, &harness.db_pool)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.status, JobStatus::Pending);
}
