//! Raw browser events emitted by probe runs.
//!
//! The external browser worker writes these rows keyed by the job that
//! produced them; the rules orchestrator fetches batches by ID and finalizes
//! them all-or-none after a clean evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use std::collections::HashMap;

use crate::common::{EventId, JobId};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub job_id: JobId,
    pub event_type: String,
    pub data: serde_json::Value,
    pub processed: bool,
    pub should_process: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl Event {
    pub fn new(job_id: JobId, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            job_id,
            event_type: event_type.into(),
            data,
            processed: false,
            should_process: true,
            created_at: Utc::now(),
        }
    }

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO events (id, job_id, event_type, data, processed, should_process, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, job_id, event_type, data, processed, should_process, created_at
            "#,
        )
        .bind(self.id)
        .bind(self.job_id)
        .bind(&self.event_type)
        .bind(&self.data)
        .bind(self.processed)
        .bind(self.should_process)
        .bind(self.created_at)
        .fetch_one(db)
        .await
    }

    /// Fetch events by ID, preserving the order of `ids`.
    ///
    /// Evaluation order inside a rules job is the payload's ID order, not
    /// whatever order the store returns rows in.
    pub async fn find_by_ids<'e>(
        ids: &[EventId],
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Vec<Self>> {
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| id.into_uuid()).collect();
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, event_type, data, processed, should_process, created_at
            FROM events
            WHERE id = ANY($1)
            "#,
        )
        .bind(&uuids)
        .fetch_all(db)
        .await?;

        let mut by_id: HashMap<EventId, Self> =
            rows.into_iter().map(|event| (event.id, event)).collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Mark a batch processed in one statement (all-or-none).
    pub async fn mark_processed<'e>(
        ids: &[EventId],
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<u64> {
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| id.into_uuid()).collect();
        let result = sqlx::query("UPDATE events SET processed = TRUE WHERE id = ANY($1)")
            .bind(&uuids)
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_by_job_id<'e>(
        job_id: JobId,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, event_type, data, processed, should_process, created_at
            FROM events
            WHERE job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(db)
        .await
    }

    /// IDs of a probe run's events still awaiting evaluation, oldest first.
    pub async fn unprocessed_ids_by_job<'e>(
        job_id: JobId,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Vec<EventId>> {
        sqlx::query_scalar(
            r#"
            SELECT id
            FROM events
            WHERE job_id = $1 AND should_process AND NOT processed
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(db)
        .await
    }
}
