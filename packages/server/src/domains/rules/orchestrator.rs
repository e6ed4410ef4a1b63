//! Rules job orchestration.
//!
//! The enqueue side validates requests and suppresses duplicate enqueues by
//! payload fingerprint within a short TTL. The processing side bounds the
//! event batch, resolves the site's alert mode (active when unreachable),
//! runs the pipeline, and finalizes events all-or-none: any per-event error
//! leaves the whole batch unprocessed so a retry re-evaluates it.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::pipeline::{PipelineContext, ProcessingResults, RulesPipeline};
use crate::common::{hash, EventId, JobId, SiteId};
use crate::domains::event::Event;
use crate::domains::site::{AlertMode, Site};
use crate::kernel::jobs::{EnqueueResult, Job, JobHandler, JobRepo, JobResult, JobType};
use crate::kernel::traits::BaseSharedCache;
use crate::kernel::ServerDeps;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("duplicate rules enqueue")]
    DuplicateEnqueue,
    #[error("rules results not found")]
    ResultsNotFound,
    #[error("rule evaluation failed: {0} event error(s)")]
    EvaluationFailed(u64),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Wire payload of a rules job (see the job payload formats).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesJobPayload {
    pub event_ids: Vec<EventId>,
    pub site_id: SiteId,
    pub scope: String,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub priority: i32,
}

/// Request to enqueue a rules evaluation batch.
#[derive(Debug, Clone)]
pub struct EnqueueRulesRequest {
    pub event_ids: Vec<EventId>,
    pub site_id: SiteId,
    pub scope: String,
    pub priority: i32,
    pub is_test: bool,
}

/// Resolves a site's alert mode for evaluation.
#[async_trait]
pub trait AlertModeResolver: Send + Sync {
    async fn resolve(&self, site_id: SiteId) -> anyhow::Result<AlertMode>;
}

/// Store-backed resolver; a missing site is active.
pub struct SiteAlertModeResolver {
    pool: PgPool,
}

impl SiteAlertModeResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertModeResolver for SiteAlertModeResolver {
    async fn resolve(&self, site_id: SiteId) -> anyhow::Result<AlertMode> {
        Ok(Site::find_by_id(site_id, &self.pool)
            .await
            .context("resolve alert mode")?
            .map(|site| site.alert_mode)
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct RulesOrchestratorOptions {
    /// Maximum events evaluated per job.
    pub batch_size: usize,
    /// TTL for both the enqueue-dedupe keys and cached results.
    pub dedupe_ttl: Duration,
}

impl Default for RulesOrchestratorOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            dedupe_ttl: Duration::from_secs(120),
        }
    }
}

pub struct RulesOrchestrator {
    pool: PgPool,
    repo: Arc<dyn JobRepo>,
    pipeline: Arc<RulesPipeline>,
    shared: Arc<dyn BaseSharedCache>,
    alert_modes: Arc<dyn AlertModeResolver>,
    options: RulesOrchestratorOptions,
}

impl RulesOrchestrator {
    pub fn new(
        pool: PgPool,
        repo: Arc<dyn JobRepo>,
        pipeline: Arc<RulesPipeline>,
        shared: Arc<dyn BaseSharedCache>,
    ) -> Self {
        let alert_modes = Arc::new(SiteAlertModeResolver::new(pool.clone()));
        Self {
            pool,
            repo,
            pipeline,
            shared,
            alert_modes,
            options: RulesOrchestratorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RulesOrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_alert_mode_resolver(mut self, resolver: Arc<dyn AlertModeResolver>) -> Self {
        self.alert_modes = resolver;
        self
    }

    /// Validate, dedupe and enqueue a rules evaluation job.
    pub async fn enqueue_rules_processing_job(
        &self,
        req: EnqueueRulesRequest,
    ) -> Result<Job, RulesError> {
        if req.event_ids.is_empty() {
            return Err(RulesError::Invalid("event_ids must not be empty".into()));
        }
        if req.scope.trim().is_empty() {
            return Err(RulesError::Invalid("scope must not be empty".into()));
        }

        let fingerprint = enqueue_fingerprint(&req);
        let dedupe_key = format!("rules_enqueue:{fingerprint}");
        let fresh = self
            .shared
            .set_nx(&dedupe_key, "1", self.options.dedupe_ttl)
            .await
            .context("rules enqueue dedupe")?;
        if !fresh {
            debug!(fingerprint = %fingerprint, "suppressed duplicate rules enqueue");
            return Err(RulesError::DuplicateEnqueue);
        }

        let payload = RulesJobPayload {
            event_ids: req.event_ids,
            site_id: req.site_id,
            scope: req.scope,
            is_test: req.is_test,
            priority: req.priority,
        };
        let job = Job::builder()
            .job_type(JobType::Rules)
            .payload(serde_json::to_value(&payload).context("encode rules payload")?)
            .priority(req.priority)
            .site_id(req.site_id)
            .is_test(req.is_test)
            .build();

        match self.repo.create(job).await? {
            EnqueueResult::Created(job) => Ok(job),
            EnqueueResult::Duplicate => Err(RulesError::DuplicateEnqueue),
        }
    }

    /// Evaluate one claimed rules job.
    pub async fn process_rules_job(&self, job: &Job) -> Result<(), RulesError> {
        let payload: RulesJobPayload =
            serde_json::from_value(job.payload.clone()).context("parse rules payload")?;

        let alert_mode = match self.alert_modes.resolve(payload.site_id).await {
            Ok(mode) => mode,
            Err(e) => {
                warn!(site_id = %payload.site_id, error = %e, "alert mode unresolved, defaulting to active");
                AlertMode::Active
            }
        };

        let mut event_ids = payload.event_ids.clone();
        if event_ids.len() > self.options.batch_size {
            warn!(
                job_id = %job.id,
                total = event_ids.len(),
                batch_size = self.options.batch_size,
                "rules batch truncated"
            );
            event_ids.truncate(self.options.batch_size);
        }

        let dry_run = job.is_test || payload.is_test;
        let events = Event::find_by_ids(&event_ids, &self.pool)
            .await
            .context("fetch events")?;

        if events.is_empty() {
            let results = ProcessingResults {
                is_dry_run: dry_run,
                alert_mode,
                ..Default::default()
            };
            self.store_results(job, &results).await?;
            return Ok(());
        }

        let ctx = PipelineContext {
            site_id: payload.site_id,
            scope: payload.scope.clone(),
            dry_run,
            alert_mode,
            job_id: job.id,
        };
        let results = self.pipeline.run(&events, &ctx).await;

        if results.errors_encountered == 0 {
            let evaluated: Vec<EventId> = events.iter().map(|e| e.id).collect();
            Event::mark_processed(&evaluated, &self.pool)
                .await
                .context("finalize events")?;
        } else {
            // Leave the batch unfinalized so a retry re-evaluates it.
            warn!(
                job_id = %job.id,
                errors = results.errors_encountered,
                "skipping event finalization"
            );
        }

        self.store_results(job, &results).await?;
        info!(
            job_id = %job.id,
            domains = results.domains_processed,
            alerts = results.alerts_created,
            skipped = results.events_skipped,
            errors = results.errors_encountered,
            dry_run = results.is_dry_run,
            "rules job processed"
        );

        if results.errors_encountered > 0 {
            return Err(RulesError::EvaluationFailed(results.errors_encountered));
        }
        Ok(())
    }

    /// Cached pipeline results for a processed job.
    pub async fn get_job_results(&self, job_id: JobId) -> Result<ProcessingResults, RulesError> {
        let cached = self
            .shared
            .get(&results_key(job_id))
            .await
            .context("read cached results")?;

        match cached {
            Some(raw) => {
                Ok(serde_json::from_str(&raw).context("decode cached results")?)
            }
            None => Err(RulesError::ResultsNotFound),
        }
    }

    /// Cache results for result polling and persist the durable summary.
    async fn store_results(&self, job: &Job, results: &ProcessingResults) -> Result<(), RulesError> {
        let encoded = serde_json::to_string(results).context("encode results")?;
        if let Err(e) = self
            .shared
            .set(&results_key(job.id), &encoded, Some(self.options.dedupe_ttl))
            .await
        {
            warn!(job_id = %job.id, error = %e, "results cache write failed");
        }

        JobResult::new(
            job.id,
            JobType::Rules,
            serde_json::to_value(results).context("encode result row")?,
        )
        .insert(&self.pool)
        .await
        .context("persist job result")?;
        Ok(())
    }
}

fn results_key(job_id: JobId) -> String {
    format!("rules_results:{job_id}")
}

/// Canonical fingerprint of an enqueue request: sorted unique event IDs plus
/// the scope coordinates.
fn enqueue_fingerprint(req: &EnqueueRulesRequest) -> String {
    let mut ids: Vec<String> = req.event_ids.iter().map(|id| id.to_string()).collect();
    ids.sort();
    ids.dedup();
    let ids_joined = ids.join(",");

    hash::hex128(&[
        req.site_id.to_string().as_bytes(),
        req.scope.as_bytes(),
        &[u8::from(req.is_test)],
        ids_joined.as_bytes(),
    ])
}

// =============================================================================
// Job handler
// =============================================================================

/// Executes `rules` jobs claimed by the worker.
pub struct RulesJobHandler {
    orchestrator: Arc<RulesOrchestrator>,
}

impl RulesJobHandler {
    pub fn new(orchestrator: Arc<RulesOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for RulesJobHandler {
    async fn execute(&self, job: &Job, _deps: Arc<ServerDeps>) -> anyhow::Result<()> {
        self.orchestrator
            .process_rules_job(job)
            .await
            .map_err(|e| anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ids: Vec<EventId>) -> EnqueueRulesRequest {
        EnqueueRulesRequest {
            event_ids: ids,
            site_id: SiteId::nil(),
            scope: "checkout".to_string(),
            priority: 0,
            is_test: false,
        }
    }

    #[test]
    fn fingerprint_ignores_event_order() {
        let a = EventId::new();
        let b = EventId::new();
        let fp1 = enqueue_fingerprint(&request(vec![a, b]));
        let fp2 = enqueue_fingerprint(&request(vec![b, a]));
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_varies_by_scope_and_mode() {
        let id = EventId::new();
        let base = request(vec![id]);

        let mut other_scope = request(vec![id]);
        other_scope.scope = "login".to_string();
        assert_ne!(enqueue_fingerprint(&base), enqueue_fingerprint(&other_scope));

        let mut test_mode = request(vec![id]);
        test_mode.is_test = true;
        assert_ne!(enqueue_fingerprint(&base), enqueue_fingerprint(&test_mode));
    }

    #[test]
    fn payload_roundtrips_with_defaults() {
        let raw = serde_json::json!({
            "event_ids": [EventId::new()],
            "site_id": SiteId::new(),
            "scope": "checkout",
        });
        let payload: RulesJobPayload = serde_json::from_value(raw).unwrap();
        assert!(!payload.is_test);
        assert_eq!(payload.priority, 0);
    }
}
