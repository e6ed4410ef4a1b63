//! Durable store for scheduled tasks, with per-task advisory locking.
//!
//! Replicas serialize work on a single task through a transaction-scoped
//! Postgres advisory lock keyed by a hash of `task_name`
//! (`pg_try_advisory_xact_lock(hashtext(...))`). Lock contention is not an
//! error: the loser simply moves on to its next due task.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

use super::task::{ScheduledTask, ScheduledTaskDefinition};
use crate::common::ScheduledTaskId;

/// A held per-task lock.
///
/// Wraps the transaction the advisory lock lives in. Dropping the guard
/// without calling `commit` rolls the transaction back, which both releases
/// the lock and undoes any task/job writes made under it.
pub struct TaskLock {
    tx: Transaction<'static, Postgres>,
}

impl TaskLock {
    /// The transaction holding the lock. All writes for this firing go here.
    pub fn tx(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.context("commit task lock")
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.context("roll back task lock")
    }
}

/// Store facade over the `scheduled_tasks` table.
#[derive(Clone)]
pub struct ScheduledTaskStore {
    pool: PgPool,
}

impl ScheduledTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Up to `limit` due tasks ordered by next-due ascending.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledTask>> {
        // Skip-locked selection needs a transaction for the row locks to
        // exist at all; they release at commit, leaving the advisory lock
        // as the real per-task serialization.
        let mut tx = self.pool.begin().await.context("begin find_due")?;
        let due = ScheduledTask::find_due(now, limit, &mut *tx)
            .await
            .context("find due tasks")?;
        tx.commit().await.context("commit find_due")?;
        Ok(due)
    }

    /// Try to take the advisory lock for `task_name`.
    ///
    /// Returns `None` when another replica holds it this instant. The caller
    /// proceeds to its next task; nothing is retried or waited on.
    pub async fn try_lock_task(&self, task_name: &str) -> Result<Option<TaskLock>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("begin lock tx for task {task_name}"))?;

        let acquired: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext($1))")
                .bind(task_name)
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("acquire advisory lock for task {task_name}"))?;

        if !acquired {
            tx.rollback()
                .await
                .with_context(|| format!("release lock tx for task {task_name}"))?;
            return Ok(None);
        }

        Ok(Some(TaskLock { tx }))
    }

    pub async fn find_by_name(&self, task_name: &str) -> Result<Option<ScheduledTask>> {
        ScheduledTask::find_by_name(task_name, &self.pool)
            .await
            .with_context(|| format!("find task {task_name}"))
    }

    /// Create or update a task definition (site reconciler, secret refresh).
    pub async fn upsert(&self, definition: &ScheduledTaskDefinition) -> Result<ScheduledTask> {
        ScheduledTask::upsert(definition, &self.pool)
            .await
            .with_context(|| format!("upsert task {}", definition.task_name))
    }

    /// Delete a task definition by name. Returns whether it existed.
    pub async fn delete(&self, task_name: &str) -> Result<bool> {
        ScheduledTask::delete_by_name(task_name, &self.pool)
            .await
            .with_context(|| format!("delete task {task_name}"))
    }

    /// Advance the firing clock inside a held task lock.
    pub async fn mark_queued_tx(
        &self,
        lock: &mut TaskLock,
        id: ScheduledTaskId,
        now: DateTime<Utc>,
        active_fire_key: Option<&str>,
    ) -> Result<bool> {
        ScheduledTask::mark_queued(id, now, active_fire_key, &mut **lock.tx())
            .await
            .context("mark task queued")
    }

    /// Update fire-key bookkeeping inside a held task lock.
    pub async fn update_active_fire_key_tx(
        &self,
        lock: &mut TaskLock,
        id: ScheduledTaskId,
        fire_key: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        ScheduledTask::update_active_fire_key(id, fire_key, now, &mut **lock.tx())
            .await
            .context("update active fire key")
    }

    /// Re-read a task inside a held lock (re-verification after acquisition).
    pub async fn find_by_name_tx(
        &self,
        lock: &mut TaskLock,
        task_name: &str,
    ) -> Result<Option<ScheduledTask>> {
        ScheduledTask::find_by_name(task_name, &mut **lock.tx())
            .await
            .with_context(|| format!("re-read task {task_name}"))
    }
}

/// Convenience constructor for interval task definitions.
impl ScheduledTaskDefinition {
    pub fn interval_task(
        task_name: impl Into<String>,
        payload: serde_json::Value,
        interval: Duration,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            payload,
            interval,
            overrun_policy: None,
            overrun_states: None,
        }
    }
}
