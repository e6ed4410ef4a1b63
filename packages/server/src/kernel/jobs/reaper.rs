//! Stale-job failover and retention cleanup.
//!
//! The reaper is the only component that moves jobs on behalf of dead
//! workers: running jobs whose lease lapsed are re-armed (or terminally
//! failed once out of retries), aged pending jobs are failed, and terminal
//! jobs plus job results are deleted on retention. Every sweep works in
//! bounded batches with skip-locked selection so any number of replicas can
//! run it concurrently, and a second pass over unchanged data touches zero
//! rows.
//!
//! Each service instance starts after a random jitter (up to 10% of the
//! interval, from the OS CSPRNG) so replicas don't stampede the store on
//! synchronized deploys.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::job::{Job, JobStatus, JobType};
use super::job_result::JobResult;
use crate::config::ReaperConfig;
use crate::kernel::service_host::Service;

const RESULT_TYPES: [JobType; 4] = [
    JobType::Browser,
    JobType::Rules,
    JobType::Alert,
    JobType::SecretRefresh,
];

/// Row counts from one full sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub recovered_leases: u64,
    pub failed_pending: u64,
    pub deleted_completed: u64,
    pub deleted_failed: u64,
    pub pruned_results: u64,
}

impl SweepStats {
    pub fn total(&self) -> u64 {
        self.recovered_leases
            + self.failed_pending
            + self.deleted_completed
            + self.deleted_failed
            + self.pruned_results
    }
}

/// One batched cleanup operation within a sweep.
enum SweepOp {
    RecoverLeases,
    FailStalePending(DateTime<Utc>),
    DeleteCompleted(DateTime<Utc>),
    DeleteFailed(DateTime<Utc>),
    PruneResults(JobType, DateTime<Utc>),
}

impl SweepOp {
    fn name(&self) -> &'static str {
        match self {
            SweepOp::RecoverLeases => "recover_expired_leases",
            SweepOp::FailStalePending(_) => "fail_stale_pending",
            SweepOp::DeleteCompleted(_) => "delete_completed",
            SweepOp::DeleteFailed(_) => "delete_failed",
            SweepOp::PruneResults(..) => "prune_job_results",
        }
    }
}

enum StepOutcome {
    Done(u64),
    Cancelled(u64),
}

pub struct Reaper {
    pool: PgPool,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(pool: PgPool, config: ReaperConfig) -> Self {
        Self { pool, config }
    }

    /// Run one full sweep.
    ///
    /// Cancellation is honored between batches: a cancelled sweep returns the
    /// partial stats collected so far with no error. Step failures are
    /// aggregated; later steps still run.
    pub async fn sweep(&self, shutdown: &CancellationToken) -> Result<SweepStats> {
        let now = Utc::now();
        let mut ops = vec![
            SweepOp::RecoverLeases,
            SweepOp::FailStalePending(now - chrono_duration(self.config.pending_max_age)),
            SweepOp::DeleteCompleted(now - chrono_duration(self.config.completed_max_age)),
            SweepOp::DeleteFailed(now - chrono_duration(self.config.failed_max_age)),
        ];
        let results_cutoff = now - chrono_duration(self.config.job_results_max_age);
        ops.extend(RESULT_TYPES.map(|t| SweepOp::PruneResults(t, results_cutoff)));

        let mut stats = SweepStats::default();
        let mut errors: Vec<anyhow::Error> = Vec::new();

        for op in ops {
            match self.run_step(&op, shutdown).await {
                Ok(StepOutcome::Done(rows)) => record(&mut stats, &op, rows),
                Ok(StepOutcome::Cancelled(rows)) => {
                    record(&mut stats, &op, rows);
                    return Ok(stats);
                }
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(stats)
        } else {
            let summary = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            Err(anyhow!(
                "reaper sweep had {} error(s): {}",
                errors.len(),
                summary
            ))
        }
    }

    /// Run one operation's batches to exhaustion.
    async fn run_step(
        &self,
        op: &SweepOp,
        shutdown: &CancellationToken,
    ) -> Result<StepOutcome> {
        let operation = op.name();
        let mut total = 0u64;

        loop {
            if shutdown.is_cancelled() {
                info!(operation, outcome = "cancelled", rows = total, "reaper.cleanup_operation");
                return Ok(StepOutcome::Cancelled(total));
            }

            let batch = self.run_batch(op).await;
            match batch {
                Ok(0) => break,
                Ok(rows) => total += rows,
                Err(e) => {
                    error!(operation, outcome = "error", error = %e, "reaper.cleanup_operation");
                    return Err(anyhow::Error::new(e).context(format!("reaper step {operation}")));
                }
            }
        }

        let outcome = if total == 0 { "noop" } else { "success" };
        info!(operation, outcome, rows = total, "reaper.cleanup_operation");
        Ok(StepOutcome::Done(total))
    }

    async fn run_batch(&self, op: &SweepOp) -> sqlx::Result<u64> {
        let batch = self.config.batch_size;
        match op {
            SweepOp::RecoverLeases => Job::recover_expired_leases(batch, &self.pool).await,
            SweepOp::FailStalePending(cutoff) => {
                Job::fail_stale_pending(*cutoff, batch, &self.pool).await
            }
            SweepOp::DeleteCompleted(cutoff) => {
                Job::delete_terminal_older_than(JobStatus::Completed, *cutoff, batch, &self.pool)
                    .await
            }
            SweepOp::DeleteFailed(cutoff) => {
                Job::delete_terminal_older_than(JobStatus::Failed, *cutoff, batch, &self.pool)
                    .await
            }
            SweepOp::PruneResults(job_type, cutoff) => {
                JobResult::delete_older_than(*job_type, *cutoff, batch, &self.pool).await
            }
        }
    }

    fn start_jitter(&self) -> Duration {
        let max_jitter = self.config.interval / 10;
        if max_jitter.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_millis(OsRng.gen_range(0..=max_jitter.as_millis() as u64))
    }
}

fn record(stats: &mut SweepStats, op: &SweepOp, rows: u64) {
    match op {
        SweepOp::RecoverLeases => stats.recovered_leases = rows,
        SweepOp::FailStalePending(_) => stats.failed_pending = rows,
        SweepOp::DeleteCompleted(_) => stats.deleted_completed = rows,
        SweepOp::DeleteFailed(_) => stats.deleted_failed = rows,
        SweepOp::PruneResults(..) => stats.pruned_results += rows,
    }
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

#[async_trait]
impl Service for Reaper {
    fn name(&self) -> &'static str {
        "reaper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let jitter = self.start_jitter();
        info!(jitter_ms = jitter.as_millis() as u64, "reaper starting");

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(jitter) => {}
        }

        loop {
            match self.sweep(&shutdown).await {
                Ok(stats) if stats.total() > 0 => {
                    info!(
                        recovered = stats.recovered_leases,
                        failed_pending = stats.failed_pending,
                        deleted_completed = stats.deleted_completed,
                        deleted_failed = stats.deleted_failed,
                        pruned_results = stats.pruned_results,
                        "reaper sweep complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "reaper sweep failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("reaper stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Reaper {
        fn unconnected_for_tests() -> Self {
            Self {
                pool: PgPool::connect_lazy("postgres://localhost/unused").unwrap(),
                config: ReaperConfig::default(),
            }
        }
    }

    #[tokio::test]
    async fn jitter_is_bounded_by_tenth_of_interval() {
        let reaper = Reaper::unconnected_for_tests();
        for _ in 0..50 {
            let jitter = reaper.start_jitter();
            assert!(jitter <= reaper.config.interval / 10);
        }
    }

    #[test]
    fn sweep_stats_total_sums_all_steps() {
        let stats = SweepStats {
            recovered_leases: 1,
            failed_pending: 2,
            deleted_completed: 3,
            deleted_failed: 4,
            pruned_results: 5,
        };
        assert_eq!(stats.total(), 15);
    }

    #[test]
    fn op_names_match_metric_tags() {
        assert_eq!(SweepOp::RecoverLeases.name(), "recover_expired_leases");
        assert_eq!(
            SweepOp::PruneResults(JobType::Rules, Utc::now()).name(),
            "prune_job_results"
        );
    }
}
