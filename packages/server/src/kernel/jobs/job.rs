//! Job model for background work execution.
//!
//! Jobs are the single hand-off point between the control plane and its
//! workers: the scheduler enqueues browser probes, the rules orchestrator
//! enqueues evaluation batches, and the alert dispatcher enqueues sink
//! deliveries. Workers reserve jobs with an expiring lease; a lease that is
//! never renewed makes the job eligible for reaping back to pending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{JobId, SiteId, SourceId};

/// Metadata keys stamped onto scheduler-created jobs.
///
/// Overrun checks find a task's outstanding jobs through these keys, so they
/// are part of the jobs table contract (see the `jobs_task_name_idx` index).
pub mod metadata {
    pub const TASK_NAME: &str = "scheduler.task_name";
    pub const INTERVAL: &str = "scheduler.interval";
    pub const FIRE_KEY: &str = "scheduler.fire_key";
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Browser,
    Rules,
    Alert,
    SecretRefresh,
}

impl JobType {
    /// Wire name, also used for notification subjects (`jobs.<type>`).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Browser => "browser",
            JobType::Rules => "rules",
            JobType::Alert => "alert",
            JobType::SecretRefresh => "secret_refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Bitmask over the outstanding states a scheduled task's jobs can be in.
///
/// `RETRYING` means a pending job that has already failed at least once
/// (`retry_count > 0`) and was re-armed. A running job whose lease has
/// expired counts as absent: its worker is presumed dead and the reaper will
/// re-arm it, so it must not block a Skip-policy firing forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobStates(pub u32);

impl JobStates {
    pub const NONE: JobStates = JobStates(0);
    pub const RUNNING: JobStates = JobStates(1);
    pub const PENDING: JobStates = JobStates(1 << 1);
    pub const RETRYING: JobStates = JobStates(1 << 2);

    pub fn contains(&self, other: JobStates) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: JobStates) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: JobStates) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for JobStates {
    type Output = JobStates;

    fn bitor(self, rhs: JobStates) -> JobStates {
        JobStates(self.0 | rhs.0)
    }
}

// ============================================================================
// Job Model
// ============================================================================

const JOB_COLUMNS: &str = "id, job_type, status, payload, metadata, priority, max_retries, \
     retry_count, lease_expires_at, site_id, source_id, is_test, error_message, fire_key, \
     created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = JobId::new())]
    pub id: JobId,

    pub job_type: JobType,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,
    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,

    /// Larger values are reserved first.
    #[builder(default = 0)]
    pub priority: i32,

    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 0)]
    pub retry_count: i32,

    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub site_id: Option<SiteId>,
    #[builder(default, setter(strip_option))]
    pub source_id: Option<SourceId>,

    #[builder(default = false)]
    pub is_test: bool,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    /// Idempotency token for scheduler firings; see `jobs_fire_key_active_uniq`.
    #[builder(default, setter(strip_option))]
    pub fire_key: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Per-type queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ListJobsOptions {
    #[builder(default, setter(strip_option))]
    pub job_type: Option<JobType>,
    #[builder(default, setter(strip_option))]
    pub status: Option<JobStatus>,
    #[builder(default, setter(strip_option))]
    pub site_id: Option<SiteId>,
    #[builder(default = 100)]
    pub limit: i64,
    #[builder(default = 0)]
    pub offset: i64,
}

// ============================================================================
// SQL Queries - ALL queries must be in models/
// ============================================================================

impl Job {
    /// Insert this job unconditionally.
    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        let query = format!(
            r#"
            INSERT INTO jobs (
                id, job_type, status, payload, metadata, priority, max_retries,
                retry_count, lease_expires_at, site_id, source_id, is_test,
                error_message, fire_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Self>(&query)
            .bind(self.id)
            .bind(self.job_type)
            .bind(self.status)
            .bind(&self.payload)
            .bind(&self.metadata)
            .bind(self.priority)
            .bind(self.max_retries)
            .bind(self.retry_count)
            .bind(self.lease_expires_at)
            .bind(self.site_id)
            .bind(self.source_id)
            .bind(self.is_test)
            .bind(&self.error_message)
            .bind(&self.fire_key)
            .bind(self.created_at)
            .bind(self.updated_at)
            .fetch_one(db)
            .await
    }

    /// Insert with fire-key idempotency: a conflict with a live job returns
    /// `None` instead of erroring.
    ///
    /// `ON CONFLICT DO NOTHING` is deliberate - a raised unique violation
    /// would abort the scheduler's task-lock transaction, and the duplicate
    /// case must leave that transaction healthy so the firing clock still
    /// commits.
    pub async fn insert_idempotent<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Option<Self>> {
        let query = format!(
            r#"
            INSERT INTO jobs (
                id, job_type, status, payload, metadata, priority, max_retries,
                retry_count, lease_expires_at, site_id, source_id, is_test,
                error_message, fire_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Self>(&query)
            .bind(self.id)
            .bind(self.job_type)
            .bind(self.status)
            .bind(&self.payload)
            .bind(&self.metadata)
            .bind(self.priority)
            .bind(self.max_retries)
            .bind(self.retry_count)
            .bind(self.lease_expires_at)
            .bind(self.site_id)
            .bind(self.source_id)
            .bind(self.is_test)
            .bind(&self.error_message)
            .bind(&self.fire_key)
            .bind(self.created_at)
            .bind(self.updated_at)
            .fetch_optional(db)
            .await
    }

    /// Find a job by ID
    pub async fn find_by_id<'e>(id: JobId, db: impl PgExecutor<'e>) -> sqlx::Result<Option<Self>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Self>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Atomically reserve the next pending job of a type and lease it.
    ///
    /// Picks highest priority first, FIFO within priority (`created_at, id`
    /// breaks ties deterministically). `FOR UPDATE SKIP LOCKED` keeps
    /// concurrent workers on disjoint rows.
    pub async fn reserve_next<'e>(
        job_type: JobType,
        lease_secs: i64,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        let query = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE job_type = $1
                  AND status = 'pending'
                  AND retry_count <= max_retries
                ORDER BY priority DESC, created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                lease_expires_at = NOW() + make_interval(secs => $2::double precision),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Self>(&query)
            .bind(job_type)
            .bind(lease_secs)
            .fetch_optional(db)
            .await
    }

    /// Extend the lease for a running job (heartbeat).
    ///
    /// Returns `false` when the job is no longer running, which tells the
    /// worker it has lost the job and must stop side effects.
    pub async fn heartbeat<'e>(
        id: JobId,
        lease_secs: i64,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + make_interval(secs => $1::double precision),
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(lease_secs)
        .bind(id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal success. Clears the lease.
    pub async fn complete<'e>(id: JobId, db: impl PgExecutor<'e>) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Record a failure.
    ///
    /// While retries remain the job is re-armed to pending with a cleared
    /// lease so a later `reserve_next` picks it up; once exhausted it becomes
    /// terminally failed.
    pub async fn fail<'e>(id: JobId, error: &str, db: impl PgExecutor<'e>) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
                status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END::job_status,
                lease_expires_at = NULL,
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Delete non-terminal jobs whose JSON payload has `field = value`.
    ///
    /// Used to purge queued refresh/delivery jobs when their parent entity is
    /// deleted. Returns the number of jobs removed.
    pub async fn delete_by_payload_field<'e>(
        job_type: JobType,
        field: &str,
        value: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE job_type = $1
              AND status IN ('pending', 'running')
              AND payload ->> $2 = $3
            "#,
        )
        .bind(job_type)
        .bind(field)
        .bind(value)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Per-status counters for a job type.
    pub async fn stats<'e>(job_type: JobType, db: impl PgExecutor<'e>) -> sqlx::Result<JobStats> {
        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE job_type = $1 GROUP BY status",
        )
        .bind(job_type)
        .fetch_all(db)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// List jobs matching the filter, newest first.
    pub async fn list<'e>(
        opts: &ListJobsOptions,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Vec<Self>> {
        let mut builder = sqlx::QueryBuilder::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"
        ));
        if let Some(job_type) = opts.job_type {
            builder.push(" AND job_type = ").push_bind(job_type);
        }
        if let Some(status) = opts.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(site_id) = opts.site_id {
            builder.push(" AND site_id = ").push_bind(site_id);
        }
        builder
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(opts.limit)
            .push(" OFFSET ")
            .push_bind(opts.offset);

        builder.build_query_as::<Self>().fetch_all(db).await
    }

    /// Whether a live running job exists for a scheduler task name.
    ///
    /// Expired-lease running jobs count as absent.
    pub async fn running_exists_by_task_name<'e>(
        task_name: &str,
        now: DateTime<Utc>,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<bool> {
        let exists: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1
            FROM jobs
            WHERE metadata ->> 'scheduler.task_name' = $1
              AND status = 'running'
              AND lease_expires_at > $2
            LIMIT 1
            "#,
        )
        .bind(task_name)
        .bind(now)
        .fetch_optional(db)
        .await?;

        Ok(exists.is_some())
    }

    /// Outstanding states of a task's jobs as a bitmask.
    pub async fn states_by_task_name<'e>(
        task_name: &str,
        now: DateTime<Utc>,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<JobStates> {
        let rows: Vec<(JobStatus, i32, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT status, retry_count, lease_expires_at
            FROM jobs
            WHERE metadata ->> 'scheduler.task_name' = $1
              AND status IN ('pending', 'running')
            "#,
        )
        .bind(task_name)
        .fetch_all(db)
        .await?;

        let mut states = JobStates::NONE;
        for (status, retry_count, lease_expires_at) in rows {
            match status {
                JobStatus::Running => {
                    // A dead worker's expired lease must not count as running.
                    if matches!(lease_expires_at, Some(at) if at > now) {
                        states.insert(JobStates::RUNNING);
                    }
                }
                JobStatus::Pending if retry_count > 0 => states.insert(JobStates::RETRYING),
                JobStatus::Pending => states.insert(JobStates::PENDING),
                _ => {}
            }
        }
        Ok(states)
    }

    // ------------------------------------------------------------------
    // Reaper sweeps (batched; skip-locked so replicas share the work)
    // ------------------------------------------------------------------

    /// Re-arm running jobs whose lease expired before `now`.
    ///
    /// Same semantics as `fail`: back to pending while retries remain,
    /// terminally failed otherwise. Returns rows touched.
    pub async fn recover_expired_leases<'e>(
        batch_size: i64,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM jobs
                WHERE status = 'running' AND lease_expires_at < NOW()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
                status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END::job_status,
                lease_expires_at = NULL,
                error_message = 'lease expired',
                updated_at = NOW()
            WHERE id IN (SELECT id FROM stale)
            "#,
        )
        .bind(batch_size)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Terminally fail pending jobs older than the cutoff.
    pub async fn fail_stale_pending<'e>(
        cutoff: DateTime<Utc>,
        batch_size: i64,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending' AND created_at < $1
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'failed',
                error_message = 'expired: exceeded pending retention',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM stale)
            "#,
        )
        .bind(cutoff)
        .bind(batch_size)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete terminal jobs of the given status older than the cutoff.
    pub async fn delete_terminal_older_than<'e>(
        status: JobStatus,
        cutoff: DateTime<Utc>,
        batch_size: i64,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE status = $1 AND created_at < $2
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(status)
        .bind(cutoff)
        .bind(batch_size)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder().job_type(JobType::Browser).build()
    }

    #[test]
    fn new_job_has_default_max_retries_of_3() {
        let job = sample_job();
        assert_eq!(job.max_retries, 3);
    }

    #[test]
    fn new_job_starts_pending_with_no_lease() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.lease_expires_at.is_none());
    }

    #[test]
    fn job_type_wire_names() {
        assert_eq!(JobType::Browser.as_str(), "browser");
        assert_eq!(JobType::SecretRefresh.as_str(), "secret_refresh");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn job_states_mask_operations() {
        let mut states = JobStates::NONE;
        assert!(states.is_empty());

        states.insert(JobStates::RUNNING);
        states.insert(JobStates::RETRYING);
        assert!(states.contains(JobStates::RUNNING));
        assert!(!states.contains(JobStates::PENDING));
        assert!(states.intersects(JobStates::RUNNING | JobStates::PENDING));
        assert!(!states.intersects(JobStates::PENDING));
    }

    #[test]
    fn builder_accepts_scheduler_fields() {
        let job = Job::builder()
            .job_type(JobType::Rules)
            .priority(10)
            .fire_key("abc123".to_string())
            .metadata(serde_json::json!({ metadata::TASK_NAME: "site:x" }))
            .build();
        assert_eq!(job.priority, 10);
        assert_eq!(job.fire_key.as_deref(), Some("abc123"));
        assert_eq!(job.metadata[metadata::TASK_NAME], "site:x");
    }
}
