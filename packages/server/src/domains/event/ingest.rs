//! Bridge from finished probe runs to rules evaluation.
//!
//! The browser worker writes raw events keyed by its job and reports the run
//! finished; this bridge collects the run's unprocessed events and enqueues
//! one rules job for them. A duplicate enqueue within the dedupe TTL (two
//! replicas observing the same run) is treated as already-bridged.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use super::models::Event;
use crate::common::{JobId, SiteId};
use crate::domains::rules::{EnqueueRulesRequest, RulesError, RulesOrchestrator};
use crate::kernel::jobs::Job;

pub struct EventIngestor {
    pool: sqlx::PgPool,
    orchestrator: Arc<RulesOrchestrator>,
}

impl EventIngestor {
    pub fn new(pool: sqlx::PgPool, orchestrator: Arc<RulesOrchestrator>) -> Self {
        Self { pool, orchestrator }
    }

    /// Enqueue rules evaluation for a probe run's outstanding events.
    ///
    /// Returns the rules job when one was created, `None` when there was
    /// nothing to evaluate or another replica already bridged the run.
    pub async fn bridge_probe_run(
        &self,
        source_job_id: JobId,
        site_id: SiteId,
        scope: &str,
        is_test: bool,
    ) -> Result<Option<Job>> {
        let event_ids = Event::unprocessed_ids_by_job(source_job_id, &self.pool).await?;
        if event_ids.is_empty() {
            debug!(job_id = %source_job_id, "probe run has no unprocessed events");
            return Ok(None);
        }

        let total = event_ids.len();
        match self
            .orchestrator
            .enqueue_rules_processing_job(EnqueueRulesRequest {
                event_ids,
                site_id,
                scope: scope.to_string(),
                priority: 0,
                is_test,
            })
            .await
        {
            Ok(job) => {
                info!(
                    source_job_id = %source_job_id,
                    rules_job_id = %job.id,
                    events = total,
                    "probe run bridged to rules job"
                );
                Ok(Some(job))
            }
            Err(RulesError::DuplicateEnqueue) => {
                debug!(job_id = %source_job_id, "probe run already bridged");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
