//! Replica-safe interval scheduler.
//!
//! Every replica runs the same tick loop; three mechanisms keep a firing
//! exactly-once per window no matter how many replicas race:
//!
//! 1. skip-locked `find_due` scans hand replicas disjoint batches,
//! 2. a per-task advisory lock serializes work on one `task_name`,
//! 3. the fire-key unique constraint on jobs is the last line of defence.
//!
//! ```text
//! Tick(now)
//!     │
//!     ├─► find_due(now, batch)                 (skip locked)
//!     └─► per task: try_lock_task(task_name)   (advisory, non-blocking)
//!             ├─ re-verify due under the lock
//!             ├─ fire_key = hex128(name ‖ window ‖ payload)
//!             └─ apply overrun policy: Queue / Skip / Reschedule
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{ScheduledTaskStore, TaskLock};
use super::task::{OverrunPolicy, ScheduledTask};
use crate::common::hash;
use crate::common::SourceId;
use crate::kernel::jobs::{metadata, Job, JobRepo, JobStates, JobType};
use crate::kernel::notify::BaseJobNotifier;
use crate::kernel::service_host::Service;

/// Task-name prefix routed to secret-refresh jobs. Unknown prefixes fall
/// through to the default job type.
pub const SECRET_REFRESH_PREFIX: &str = "secret-refresh:";

/// Resolves a source's probe script at enqueue time.
///
/// Implemented by the source cache; optional so the scheduler can run
/// without script enrichment (payloads pass through untouched).
#[async_trait]
pub trait ScriptResolver: Send + Sync {
    async fn resolve_script(&self, source_id: SourceId) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    pub batch_size: i64,
    pub default_overrun_policy: OverrunPolicy,
    pub default_overrun_states: JobStates,
    pub default_job_type: JobType,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            batch_size: 25,
            default_overrun_policy: OverrunPolicy::Skip,
            default_overrun_states: JobStates::RUNNING,
            default_job_type: JobType::Browser,
        }
    }
}

/// Outcome of one tick: partial progress plus the first task failure.
pub struct TickReport {
    pub processed: usize,
    pub error: Option<anyhow::Error>,
}

pub struct Scheduler {
    store: ScheduledTaskStore,
    repo: Arc<dyn JobRepo>,
    notifier: Arc<dyn BaseJobNotifier>,
    script_resolver: Option<Arc<dyn ScriptResolver>>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(
        store: ScheduledTaskStore,
        repo: Arc<dyn JobRepo>,
        notifier: Arc<dyn BaseJobNotifier>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            repo,
            notifier,
            script_resolver: None,
            options,
        }
    }

    /// Attach a script resolver for browser payload enrichment.
    pub fn with_script_resolver(mut self, resolver: Arc<dyn ScriptResolver>) -> Self {
        self.script_resolver = Some(resolver);
        self
    }

    /// One pass over due tasks.
    ///
    /// A task counts as processed iff this invocation changed state for it
    /// (mark-queued, enqueue, or fire-key update). Lock misses and tasks
    /// that stopped being due under the lock do not count.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let due = match self.store.find_due(now, self.options.batch_size).await {
            Ok(due) => due,
            Err(e) => {
                return TickReport {
                    processed: 0,
                    error: Some(e.context("find due tasks")),
                }
            }
        };

        let mut processed = 0;
        for task in due {
            let task_name = task.task_name.clone();
            match self.process_task(&task, now).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    return TickReport {
                        processed,
                        error: Some(e.context(format!("process task {task_name}"))),
                    }
                }
            }
        }

        TickReport {
            processed,
            error: None,
        }
    }

    async fn process_task(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut lock) = self.store.try_lock_task(&task.task_name).await? else {
            debug!(task = %task.task_name, "task locked by another replica");
            return Ok(false);
        };

        // The snapshot from find_due may be stale; another replica can have
        // fired this task between the scan and the lock.
        let Some(task) = self.store.find_by_name_tx(&mut lock, &task.task_name).await? else {
            lock.commit().await?;
            return Ok(false);
        };
        if !task.is_due(now) {
            lock.commit().await?;
            return Ok(false);
        }

        let interval_ms = (task.interval_secs.max(1)) * 1000;
        let window = now.timestamp_millis().div_euclid(interval_ms);
        let payload_bytes = serde_json::to_vec(&task.payload).context("encode task payload")?;
        let fire_key = hash::fire_key(&task.task_name, window, &payload_bytes);

        let policy = task.overrun_policy.unwrap_or(self.options.default_overrun_policy);
        let states = task
            .overrun_states()
            .unwrap_or(self.options.default_overrun_states);

        match policy {
            OverrunPolicy::Queue => {
                let job = self.build_job(&task, &fire_key).await?;
                let job_type = job.job_type;
                let result = self.repo.create_in_tx(lock.tx(), job).await?;

                if !self
                    .store
                    .mark_queued_tx(&mut lock, task.id, now, Some(&fire_key))
                    .await?
                {
                    // Task deleted mid-tick; drop the firing with it.
                    lock.rollback().await?;
                    return Ok(false);
                }
                lock.commit().await?;

                if result.is_created() {
                    self.notify(job_type).await;
                    info!(task = %task.task_name, fire_key = %fire_key, "scheduled job enqueued");
                } else {
                    debug!(task = %task.task_name, fire_key = %fire_key, "firing already enqueued");
                }
                Ok(true)
            }
            OverrunPolicy::Skip => {
                let outstanding =
                    Job::states_by_task_name(&task.task_name, now, &mut **lock.tx())
                        .await
                        .context("check outstanding job states")?;

                if outstanding.intersects(states) {
                    if !self
                        .store
                        .mark_queued_tx(&mut lock, task.id, now, None)
                        .await?
                    {
                        lock.rollback().await?;
                        return Ok(false);
                    }
                    lock.commit().await?;
                    debug!(
                        task = %task.task_name,
                        states = outstanding.0,
                        "skipped firing: prior job still outstanding"
                    );
                    return Ok(true);
                }

                if !self
                    .store
                    .mark_queued_tx(&mut lock, task.id, now, None)
                    .await?
                {
                    lock.rollback().await?;
                    return Ok(false);
                }
                let job = self.build_job(&task, &fire_key).await?;
                let job_type = job.job_type;
                let result = self.repo.create_in_tx(lock.tx(), job).await?;
                self.store
                    .update_active_fire_key_tx(&mut lock, task.id, &fire_key, now)
                    .await?;
                lock.commit().await?;

                if result.is_created() {
                    self.notify(job_type).await;
                    info!(task = %task.task_name, fire_key = %fire_key, "scheduled job enqueued");
                }
                Ok(true)
            }
            OverrunPolicy::Reschedule => {
                if !self
                    .store
                    .mark_queued_tx(&mut lock, task.id, now, None)
                    .await?
                {
                    lock.rollback().await?;
                    return Ok(false);
                }
                lock.commit().await?;
                debug!(task = %task.task_name, "rescheduled without enqueue");
                Ok(true)
            }
        }
    }

    /// Route the job type by task-name prefix and build the outgoing job.
    async fn build_job(&self, task: &ScheduledTask, fire_key: &str) -> Result<Job> {
        let job_type = if task.task_name.starts_with(SECRET_REFRESH_PREFIX) {
            JobType::SecretRefresh
        } else {
            self.options.default_job_type
        };

        let payload = match job_type {
            JobType::Browser => self.browser_payload(task).await?,
            _ => task.payload.clone(),
        };

        let job_metadata = serde_json::json!({
            metadata::TASK_NAME: task.task_name,
            metadata::INTERVAL: format!("{}s", task.interval_secs),
            metadata::FIRE_KEY: fire_key,
        });

        let mut job = Job::builder()
            .job_type(job_type)
            .payload(payload.clone())
            .metadata(job_metadata)
            .fire_key(fire_key.to_string())
            .build();
        job.site_id = field_id::<crate::common::id::Site>(&payload, "site_id");
        job.source_id = field_id::<crate::common::id::Source>(&payload, "source_id");

        Ok(job)
    }

    /// Browser payloads go out as `{site_id, source_id, script}` with the
    /// script resolved at enqueue time. Payloads that carry their own script
    /// (or no source reference at all) pass through unchanged.
    async fn browser_payload(&self, task: &ScheduledTask) -> Result<serde_json::Value> {
        let Some(resolver) = &self.script_resolver else {
            return Ok(task.payload.clone());
        };
        let Some(source_id) = field_id::<crate::common::id::Source>(&task.payload, "source_id")
        else {
            return Ok(task.payload.clone());
        };

        let script = match task.payload.get("script").and_then(|v| v.as_str()) {
            Some(script) => script.to_string(),
            None => resolver
                .resolve_script(source_id)
                .await
                .with_context(|| format!("resolve script for source {source_id}"))?,
        };

        let mut payload = serde_json::Map::new();
        if let Some(site_id) = task.payload.get("site_id") {
            payload.insert("site_id".to_string(), site_id.clone());
        }
        payload.insert(
            "source_id".to_string(),
            serde_json::Value::String(source_id.to_string()),
        );
        payload.insert("script".to_string(), serde_json::Value::String(script));
        Ok(serde_json::Value::Object(payload))
    }

    async fn notify(&self, job_type: JobType) {
        if let Err(e) = self.notifier.notify(job_type.as_str()).await {
            warn!(job_type = job_type.as_str(), error = %e, "job wakeup publish failed");
        }
    }
}

fn field_id<T>(payload: &serde_json::Value, field: &str) -> Option<crate::common::Id<T>> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| crate::common::Id::parse(s).ok())
}

#[async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            batch_size = self.options.batch_size,
            tick_interval_ms = self.options.tick_interval.as_millis() as u64,
            "scheduler starting"
        );

        loop {
            let report = self.tick(Utc::now()).await;
            if let Some(e) = report.error {
                error!(processed = report.processed, error = %e, "scheduler tick failed");
            } else if report.processed > 0 {
                debug!(processed = report.processed, "scheduler tick complete");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.tick_interval) => {}
            }
        }

        info!("scheduler stopped");
        Ok(())
    }
}
