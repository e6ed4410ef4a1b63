//! PostgreSQL-backed job repository.
//!
//! This module provides the queue protocol the rest of the control plane
//! talks to: idempotent creation (fire-key aware), reserve-with-lease,
//! heartbeat, terminal transitions, payload-indexed deletion and counters.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, warn};

use super::job::{Job, JobStates, JobStats, JobType, ListJobsOptions};
use crate::common::JobId;
use crate::kernel::notify::BaseJobNotifier;

/// Result of enqueue operations that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// The job was inserted.
    Created(Job),
    /// A non-terminal job with the same fire key already exists. Another
    /// replica won the race; this is success, not an error.
    Duplicate,
}

impl EnqueueResult {
    /// Returns true if this call inserted the job
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Persistent queue protocol over the relational store.
///
/// Replicas coordinate exclusively through these operations; there is no
/// worker identity concept. Callers that reserve a job stop heartbeating
/// once they release it.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert a job and publish a best-effort wakeup for its type.
    async fn create(&self, job: Job) -> Result<EnqueueResult>;

    /// Insert a job inside the caller's transaction.
    ///
    /// No wakeup is published; the caller notifies after commit if it cares
    /// about latency. Used by the scheduler to keep fire-key accounting and
    /// job creation atomic.
    async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: Job,
    ) -> Result<EnqueueResult>;

    /// Reserve the next pending job of a type with a lease, if any.
    async fn reserve_next(&self, job_type: JobType, lease_secs: i64) -> Result<Option<Job>>;

    /// Extend a running job's lease. `false` means the job was lost.
    async fn heartbeat(&self, id: JobId, lease_secs: i64) -> Result<bool>;

    /// Terminal success.
    async fn complete(&self, id: JobId) -> Result<()>;

    /// Failure; re-arms to pending while retries remain.
    async fn fail(&self, id: JobId, error: &str) -> Result<()>;

    /// Delete non-terminal jobs whose payload field matches. Returns count.
    async fn delete_by_payload_field(
        &self,
        job_type: JobType,
        field: &str,
        value: &str,
    ) -> Result<u64>;

    /// Per-status counters for a type.
    async fn stats(&self, job_type: JobType) -> Result<JobStats>;

    /// List jobs matching the filter.
    async fn list(&self, opts: ListJobsOptions) -> Result<Vec<Job>>;

    /// Whether a live running job exists for a scheduler task name.
    async fn running_job_exists_by_task_name(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Outstanding job states for a scheduler task name.
    async fn job_states_by_task_name(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> Result<JobStates>;
}

/// PostgreSQL-backed `JobRepo`.
pub struct PostgresJobRepo {
    pool: PgPool,
    notifier: Arc<dyn BaseJobNotifier>,
}

impl PostgresJobRepo {
    pub fn new(pool: PgPool, notifier: Arc<dyn BaseJobNotifier>) -> Self {
        Self { pool, notifier }
    }
}

fn map_inserted(inserted: Option<Job>) -> EnqueueResult {
    match inserted {
        Some(job) => EnqueueResult::Created(job),
        None => {
            debug!("fire key already enqueued by another replica");
            EnqueueResult::Duplicate
        }
    }
}

#[async_trait]
impl JobRepo for PostgresJobRepo {
    async fn create(&self, job: Job) -> Result<EnqueueResult> {
        let job_type = job.job_type;
        let result = map_inserted(
            job.insert_idempotent(&self.pool)
                .await
                .context("insert job")?,
        );

        if result.is_created() {
            // Best effort: a lost wakeup only delays pickup until the next poll.
            if let Err(e) = self.notifier.notify(job_type.as_str()).await {
                warn!(job_type = job_type.as_str(), error = %e, "job wakeup publish failed");
            }
        }
        Ok(result)
    }

    async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: Job,
    ) -> Result<EnqueueResult> {
        Ok(map_inserted(
            job.insert_idempotent(&mut **tx)
                .await
                .context("insert job")?,
        ))
    }

    async fn reserve_next(&self, job_type: JobType, lease_secs: i64) -> Result<Option<Job>> {
        Job::reserve_next(job_type, lease_secs, &self.pool)
            .await
            .context("reserve next job")
    }

    async fn heartbeat(&self, id: JobId, lease_secs: i64) -> Result<bool> {
        Job::heartbeat(id, lease_secs, &self.pool)
            .await
            .with_context(|| format!("heartbeat job {id}"))
    }

    async fn complete(&self, id: JobId) -> Result<()> {
        Job::complete(id, &self.pool)
            .await
            .with_context(|| format!("complete job {id}"))
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        Job::fail(id, error, &self.pool)
            .await
            .with_context(|| format!("fail job {id}"))
    }

    async fn delete_by_payload_field(
        &self,
        job_type: JobType,
        field: &str,
        value: &str,
    ) -> Result<u64> {
        Job::delete_by_payload_field(job_type, field, value, &self.pool)
            .await
            .context("delete jobs by payload field")
    }

    async fn stats(&self, job_type: JobType) -> Result<JobStats> {
        Job::stats(job_type, &self.pool).await.context("job stats")
    }

    async fn list(&self, opts: ListJobsOptions) -> Result<Vec<Job>> {
        Job::list(&opts, &self.pool).await.context("list jobs")
    }

    async fn running_job_exists_by_task_name(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Job::running_exists_by_task_name(task_name, now, &self.pool)
            .await
            .with_context(|| format!("check running jobs for task {task_name}"))
    }

    async fn job_states_by_task_name(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> Result<JobStates> {
        Job::states_by_task_name(task_name, now, &self.pool)
            .await
            .with_context(|| format!("job states for task {task_name}"))
    }
}
