//! Recurring task model for the interval scheduler.
//!
//! A `ScheduledTask` row is the durable definition of something that fires
//! every `interval_secs`: a site probe (`site:<uuid>`) or a secret refresh
//! (`secret-refresh:<uuid>`). `task_name` is the cross-replica mutual
//! exclusion key; `last_queued_at` is the monotonic firing clock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use std::time::Duration;

use crate::common::ScheduledTaskId;
use crate::kernel::jobs::JobStates;

/// What to do when a task comes due while a prior firing is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "overrun_policy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Enqueue regardless; the fire-key constraint still dedupes replicas.
    Queue,
    /// Advance the clock without enqueueing while blocking states exist.
    #[default]
    Skip,
    /// Advance the clock and never enqueue.
    Reschedule,
}

impl OverrunPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrunPolicy::Queue => "queue",
            OverrunPolicy::Skip => "skip",
            OverrunPolicy::Reschedule => "reschedule",
        }
    }
}

const TASK_COLUMNS: &str = "id, task_name, payload, interval_secs, last_queued_at, \
     overrun_policy, overrun_state_mask, active_fire_key, active_fire_key_set_at, \
     created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: ScheduledTaskId,
    pub task_name: String,
    pub payload: serde_json::Value,
    pub interval_secs: i64,
    pub last_queued_at: Option<DateTime<Utc>>,
    pub overrun_policy: Option<OverrunPolicy>,
    pub overrun_state_mask: Option<i32>,
    pub active_fire_key: Option<String>,
    pub active_fire_key_set_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Definition used to create or update a task (reconcilers upsert these).
#[derive(Debug, Clone)]
pub struct ScheduledTaskDefinition {
    pub task_name: String,
    pub payload: serde_json::Value,
    pub interval: Duration,
    pub overrun_policy: Option<OverrunPolicy>,
    pub overrun_states: Option<JobStates>,
}

impl ScheduledTask {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(0) as u64)
    }

    /// A task is due when `now >= (last_queued_at ?? -inf) + interval`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_queued_at {
            None => true,
            Some(last) => now >= last + ChronoDuration::seconds(self.interval_secs),
        }
    }

    /// Overrun state mask, if the row overrides the scheduler default.
    pub fn overrun_states(&self) -> Option<JobStates> {
        self.overrun_state_mask.map(|mask| JobStates(mask as u32))
    }

    // ========================================================================
    // SQL Queries - ALL queries must be in models/
    // ========================================================================

    /// Up to `limit` due tasks, next-due first.
    ///
    /// Skip-locked so concurrent replicas scanning in parallel take disjoint
    /// batches; the per-task advisory lock remains the real serialization.
    pub async fn find_due<'e>(
        now: DateTime<Utc>,
        limit: i64,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Vec<Self>> {
        let query = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM scheduled_tasks
            WHERE COALESCE(last_queued_at, 'epoch'::timestamptz)
                  + make_interval(secs => interval_secs::double precision) <= $1
            ORDER BY COALESCE(last_queued_at, 'epoch'::timestamptz)
                  + make_interval(secs => interval_secs::double precision)
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        );

        sqlx::query_as::<_, Self>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(db)
            .await
    }

    pub async fn find_by_name<'e>(
        task_name: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE task_name = $1");
        sqlx::query_as::<_, Self>(&query)
            .bind(task_name)
            .fetch_optional(db)
            .await
    }

    /// Create or update a task definition by name.
    ///
    /// Updating never touches `last_queued_at`, so a reconciled task keeps
    /// its firing clock.
    pub async fn upsert<'e>(
        definition: &ScheduledTaskDefinition,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Self> {
        let query = format!(
            r#"
            INSERT INTO scheduled_tasks (
                id, task_name, payload, interval_secs, overrun_policy,
                overrun_state_mask, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (task_name) DO UPDATE SET
                payload = EXCLUDED.payload,
                interval_secs = EXCLUDED.interval_secs,
                overrun_policy = EXCLUDED.overrun_policy,
                overrun_state_mask = EXCLUDED.overrun_state_mask,
                updated_at = NOW()
            RETURNING {TASK_COLUMNS}
            "#
        );

        sqlx::query_as::<_, Self>(&query)
            .bind(ScheduledTaskId::new())
            .bind(&definition.task_name)
            .bind(&definition.payload)
            .bind(definition.interval.as_secs() as i64)
            .bind(definition.overrun_policy)
            .bind(definition.overrun_states.map(|s| s.0 as i32))
            .fetch_one(db)
            .await
    }

    /// Delete by name. Returns whether a row existed.
    pub async fn delete_by_name<'e>(
        task_name: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE task_name = $1")
            .bind(task_name)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Advance the firing clock; optionally install the active fire key.
    ///
    /// Returns `false` when the task no longer exists.
    pub async fn mark_queued<'e>(
        id: ScheduledTaskId,
        now: DateTime<Utc>,
        active_fire_key: Option<&str>,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET last_queued_at = $2,
                active_fire_key = COALESCE($3, active_fire_key),
                active_fire_key_set_at = CASE WHEN $3 IS NULL THEN active_fire_key_set_at ELSE $2 END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(active_fire_key)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Update only the fire-key bookkeeping.
    pub async fn update_active_fire_key<'e>(
        id: ScheduledTaskId,
        fire_key: &str,
        now: DateTime<Utc>,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET active_fire_key = $2,
                active_fire_key_set_at = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(fire_key)
        .bind(now)
        .execute(db)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_interval(interval_secs: i64, last_queued_at: Option<DateTime<Utc>>) -> ScheduledTask {
        ScheduledTask {
            id: ScheduledTaskId::new(),
            task_name: "site:test".to_string(),
            payload: serde_json::json!({}),
            interval_secs,
            last_queued_at,
            overrun_policy: None,
            overrun_state_mask: None,
            active_fire_key: None,
            active_fire_key_set_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn never_queued_task_is_due() {
        let task = task_with_interval(30, None);
        assert!(task.is_due(Utc::now()));
    }

    #[test]
    fn recently_queued_task_is_not_due() {
        let now = Utc::now();
        let task = task_with_interval(30, Some(now - ChronoDuration::seconds(10)));
        assert!(!task.is_due(now));
    }

    #[test]
    fn task_becomes_due_after_interval() {
        let now = Utc::now();
        let task = task_with_interval(30, Some(now - ChronoDuration::seconds(30)));
        assert!(task.is_due(now));
    }

    #[test]
    fn overrun_states_maps_mask() {
        let mut task = task_with_interval(30, None);
        assert!(task.overrun_states().is_none());

        task.overrun_state_mask = Some((JobStates::RUNNING | JobStates::RETRYING).0 as i32);
        let states = task.overrun_states().unwrap();
        assert!(states.contains(JobStates::RUNNING));
        assert!(states.contains(JobStates::RETRYING));
        assert!(!states.contains(JobStates::PENDING));
    }
}
