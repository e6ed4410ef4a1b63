//! Retained execution summaries for audit.
//!
//! Each processed job may leave one `JobResult` row describing what it did
//! (counters, outcomes). Rows are pruned per job type on retention by the
//! reaper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

use super::job::JobType;
use crate::common::JobId;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: Uuid,
    pub job_id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(job_id: JobId, job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            job_type,
            payload,
            created_at: Utc::now(),
        }
    }

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO job_results (id, job_id, job_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, job_id, job_type, payload, created_at
            "#,
        )
        .bind(self.id)
        .bind(self.job_id)
        .bind(self.job_type)
        .bind(&self.payload)
        .bind(self.created_at)
        .fetch_one(db)
        .await
    }

    pub async fn find_by_job_id<'e>(
        job_id: JobId,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, job_type, payload, created_at
            FROM job_results
            WHERE job_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(db)
        .await
    }

    /// Delete results of one job type older than the cutoff, batched.
    pub async fn delete_older_than<'e>(
        job_type: JobType,
        cutoff: DateTime<Utc>,
        batch_size: i64,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_results
            WHERE id IN (
                SELECT id
                FROM job_results
                WHERE job_type = $1 AND created_at < $2
                LIMIT $3
            )
            "#,
        )
        .bind(job_type)
        .bind(cutoff)
        .bind(batch_size)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }
}
