//! Job worker service.
//!
//! The `JobWorker` is a long-running service that:
//! - Reserves ready jobs (with a lease) for each registered job type
//! - Dispatches them to handlers from the `JobRegistry`
//! - Heartbeats the lease while a handler runs
//! - Marks jobs completed or failed (the repo re-arms retries)
//!
//! # Architecture
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► reserve_next per handled type (lease installed)
//!     ├─► JobHandler.execute(job, deps)  ──┐
//!     │        heartbeat task ◄────────────┘ (cancelled when execute returns)
//!     └─► complete / fail via JobRepo
//! ```
//!
//! Wakeup notifications are best-effort, so the worker polls on a timer
//! regardless of the notifier being wired.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::Job;
use super::queue::JobRepo;
use super::registry::JobRegistry;
use crate::kernel::notify::BaseJobNotifier;
use crate::kernel::service_host::Service;
use crate::kernel::ServerDeps;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// How long to wait between polls when no jobs are available.
    pub poll_interval: Duration,
    /// Lease installed on reserve and renewed by heartbeats.
    pub lease_secs: i64,
    /// How often to renew the lease for a running job.
    pub heartbeat_interval: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            lease_secs: 120,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Claims and executes jobs for every type in the registry.
pub struct JobWorker {
    repo: Arc<dyn JobRepo>,
    registry: Arc<JobRegistry>,
    deps: Arc<ServerDeps>,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(repo: Arc<dyn JobRepo>, registry: Arc<JobRegistry>, deps: Arc<ServerDeps>) -> Self {
        Self {
            repo,
            registry,
            deps,
            config: JobWorkerConfig::default(),
        }
    }

    pub fn with_config(
        repo: Arc<dyn JobRepo>,
        registry: Arc<JobRegistry>,
        deps: Arc<ServerDeps>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            deps,
            config,
        }
    }

    /// Idle wait: returns after the poll interval, or earlier when a wakeup
    /// arrives for any handled type. Wakeups are best effort, so the timer
    /// is what guarantees progress.
    async fn wait_for_wakeup(&self) {
        let types = self.registry.handled_types();
        if types.is_empty() {
            tokio::time::sleep(self.config.poll_interval).await;
            return;
        }

        let notifier: Arc<dyn BaseJobNotifier> = self.deps.notifier.clone();
        let waits = types
            .into_iter()
            .map(|job_type| {
                let notifier = notifier.clone();
                let timeout = self.config.poll_interval;
                Box::pin(async move {
                    let _ = notifier.wait(job_type.as_str(), timeout).await;
                })
            })
            .collect::<Vec<_>>();
        futures::future::select_all(waits).await;
    }

    /// Reserve and run at most one job per handled type.
    ///
    /// Returns how many jobs were executed, so the main loop can skip the
    /// idle sleep while the queue is hot.
    pub async fn drain_once(&self) -> usize {
        let mut executed = 0;
        for job_type in self.registry.handled_types() {
            let job = match self.repo.reserve_next(job_type, self.config.lease_secs).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(job_type = job_type.as_str(), error = %e, "failed to reserve job");
                    continue;
                }
            };
            self.process_job(job).await;
            executed += 1;
        }
        executed
    }

    async fn process_job(&self, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type;

        let handler = match self.registry.handler_for(job_type) {
            Some(handler) => handler,
            None => {
                // reserve_next is only called for handled types; hitting this
                // means the registry changed under us.
                error!(job_id = %job_id, "no handler for reserved job");
                if let Err(e) = self.repo.fail(job_id, "no handler registered").await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                }
                return;
            }
        };

        debug!(job_id = %job_id, job_type = job_type.as_str(), "executing job");

        let result = self.execute_with_heartbeat(&job, handler).await;

        match result {
            Ok(()) => {
                debug!(job_id = %job_id, job_type = job_type.as_str(), "job succeeded");
                if let Err(e) = self.repo.complete(job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as completed");
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, job_type = job_type.as_str(), error = %e, "job failed");
                if let Err(mark_err) = self.repo.fail(job_id, &e.to_string()).await {
                    error!(job_id = %job_id, error = %mark_err, "failed to mark job as failed");
                }
            }
        }
    }

    /// Execute a handler with periodic lease renewal.
    ///
    /// The heartbeat task stops before the terminal transition so this worker
    /// never renews a job it has released.
    async fn execute_with_heartbeat(
        &self,
        job: &Job,
        handler: Arc<dyn super::registry::JobHandler>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        let heartbeat_cancel = cancel.clone();
        let repo = self.repo.clone();
        let job_id = job.id;
        let lease_secs = self.config.lease_secs;
        let heartbeat_interval = self.config.heartbeat_interval;

        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match repo.heartbeat(job_id, lease_secs).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(job_id = %job_id, "job no longer running, stopping heartbeat");
                                break;
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        });

        let result = handler.execute(job, self.deps.clone()).await;

        cancel.cancel();
        let _ = heartbeat_handle.await;

        result
    }
}

#[async_trait]
impl Service for JobWorker {
    fn name(&self) -> &'static str {
        "job-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            lease_secs = self.config.lease_secs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let executed = self.drain_once().await;

            if executed == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.wait_for_wakeup() => {}
                }
            }
        }

        info!("job worker stopped");
        Ok(())
    }
}
