//! Rules evaluation pipeline.
//!
//! Takes a batch of browser events and runs each processable event through
//! the rule chain: unknown-domain first, then IOC matching. Per-event
//! failures increment a counter and never abort the batch; the orchestrator
//! decides afterwards whether the batch may be finalized.
//!
//! Dry runs (`is_test` jobs) evaluate with `peek` instead of the mutating
//! alert-once claim and collect would-be alerts instead of creating them.
//! Seen-recording still happens: dry runs deliberately establish baselines.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::caches::{
    ioc_key, unknown_domain_key, AlertOnceCache, IocLookupCache, Scope, SeenDomainsCache,
    DEFAULT_ALERT_TTL,
};
use super::extractor::{ExtractError, FileEventExtractor, NetworkEventExtractor};
use super::filter::EventFilter;
use super::models::{DomainAllowlist, Rule};
use crate::common::{JobId, SiteId};
use crate::domains::alert::{AlertService, CreateAlertRequest};
use crate::domains::event::Event;
use crate::domains::site::AlertMode;

/// Outcome of one rule applied to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AlertCreated,
    Allowlisted,
    AlreadySeen,
    Deduped,
    NormalizationFailed,
    Error,
}

/// Counters and collected previews from one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingResults {
    pub domains_processed: u64,
    pub unknown_domains: u64,
    pub ioc_host_matches: u64,
    pub alerts_created: u64,
    pub events_skipped: u64,
    pub would_alert_unknown: Vec<String>,
    pub would_alert_ioc: Vec<String>,
    pub errors_encountered: u64,
    pub processing_time_ms: u64,
    pub is_dry_run: bool,
    pub alert_mode: AlertMode,
}

/// Per-run evaluation context.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub site_id: SiteId,
    pub scope: String,
    pub dry_run: bool,
    pub alert_mode: AlertMode,
    pub job_id: JobId,
}

pub struct RulesPipeline {
    pool: PgPool,
    seen: SeenDomainsCache,
    alert_once: AlertOnceCache,
    iocs: IocLookupCache,
    alerts: Arc<AlertService>,
    unknown_alert_ttl: Duration,
}

impl RulesPipeline {
    pub fn new(
        pool: PgPool,
        seen: SeenDomainsCache,
        alert_once: AlertOnceCache,
        alerts: Arc<AlertService>,
    ) -> Self {
        let iocs = IocLookupCache::new(pool.clone());
        Self {
            pool,
            seen,
            alert_once,
            iocs,
            alerts,
            unknown_alert_ttl: DEFAULT_ALERT_TTL,
        }
    }

    /// Override the unknown-domain alert-once TTL (per-rule configuration).
    pub fn with_unknown_alert_ttl(mut self, ttl: Duration) -> Self {
        self.unknown_alert_ttl = ttl;
        self
    }

    /// Apply per-rule tuning from the rules table, if any rows exist.
    pub async fn load_rule_config(mut self, pool: &PgPool) -> Result<Self> {
        if let Some(rule) = Rule::find_by_type("unknown-domain", pool).await? {
            if let Some(ttl) = rule.alert_ttl() {
                self.unknown_alert_ttl = ttl;
            }
        }
        Ok(self)
    }

    /// Evaluate a batch of events in order.
    pub async fn run(&self, events: &[Event], ctx: &PipelineContext) -> ProcessingResults {
        let start = Instant::now();
        let mut results = ProcessingResults {
            is_dry_run: ctx.dry_run,
            alert_mode: ctx.alert_mode,
            ..Default::default()
        };
        let scope = Scope::new(ctx.site_id, ctx.scope.clone());

        for event in events {
            if !event.should_process || !EventFilter::global().is_processable(&event.event_type) {
                results.events_skipped += 1;
                continue;
            }

            let domain = match NetworkEventExtractor::domain(event) {
                Ok(domain) => domain,
                Err(ExtractError::MissingUrl) => {
                    // Not a network event. File events carry hashes instead.
                    match FileEventExtractor::hash(event) {
                        Ok(hash) => {
                            match self.file_ioc_rule(&scope, &hash, event, ctx, &mut results).await
                            {
                                Ok(decision) => {
                                    debug!(event_id = %event.id, ?decision, "file ioc rule")
                                }
                                Err(e) => {
                                    warn!(event_id = %event.id, error = %e, "file ioc rule error");
                                    results.errors_encountered += 1;
                                }
                            }
                        }
                        Err(_) => results.events_skipped += 1,
                    }
                    continue;
                }
                Err(e) => {
                    debug!(event_id = %event.id, error = %e, "domain normalization failed");
                    results.events_skipped += 1;
                    continue;
                }
            };
            results.domains_processed += 1;

            match self
                .unknown_domain_rule(&scope, &domain, event, ctx, &mut results)
                .await
            {
                Ok(decision) => {
                    debug!(event_id = %event.id, domain = %domain, ?decision, "unknown-domain rule")
                }
                Err(e) => {
                    warn!(event_id = %event.id, domain = %domain, error = %e, "unknown-domain rule error");
                    results.errors_encountered += 1;
                }
            }

            match self.ioc_rule(&scope, &domain, event, ctx, &mut results).await {
                Ok(Some(decision)) => {
                    debug!(event_id = %event.id, domain = %domain, ?decision, "ioc rule")
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(event_id = %event.id, domain = %domain, error = %e, "ioc rule error");
                    results.errors_encountered += 1;
                }
            }
        }

        results.processing_time_ms = start.elapsed().as_millis() as u64;
        results
    }

    /// Alert once per scope on domains outside the allowlist and baseline.
    async fn unknown_domain_rule(
        &self,
        scope: &Scope,
        domain: &str,
        event: &Event,
        ctx: &PipelineContext,
        results: &mut ProcessingResults,
    ) -> Result<Decision> {
        if DomainAllowlist::is_allowlisted(scope.site_id, domain, &self.pool).await? {
            // Allowlisted traffic still seeds the baseline.
            self.seen.record(scope, domain).await?;
            return Ok(Decision::Allowlisted);
        }

        if self.seen.exists(scope, domain).await? {
            return Ok(Decision::AlreadySeen);
        }
        results.unknown_domains += 1;

        let dedupe_key = unknown_domain_key(domain);

        if ctx.dry_run {
            if self.alert_once.peek(scope, &dedupe_key).await? {
                return Ok(Decision::Deduped);
            }
            results.would_alert_unknown.push(domain.to_string());
            self.seen.record(scope, domain).await?;
            return Ok(Decision::AlertCreated);
        }

        if self
            .alert_once
            .seen(scope, &dedupe_key, self.unknown_alert_ttl)
            .await?
        {
            return Ok(Decision::Deduped);
        }

        self.alerts
            .create(
                CreateAlertRequest::builder()
                    .site_id(scope.site_id)
                    .rule_type("unknown-domain")
                    .severity("medium")
                    .title(format!("Unknown domain observed: {domain}"))
                    .description(format!(
                        "Domain {domain} was contacted during a probe of scope {} and is not in the allowlist or seen baseline.",
                        scope.name
                    ))
                    .event_context(serde_json::json!({
                        "domain": domain,
                        "event_id": event.id,
                        "event_type": event.event_type,
                        "scope": scope.name,
                        "job_id": ctx.job_id,
                    }))
                    .build(),
            )
            .await?;
        results.alerts_created += 1;
        self.seen.record(scope, domain).await?;
        Ok(Decision::AlertCreated)
    }

    /// Alert on domains matching an active indicator of compromise.
    async fn ioc_rule(
        &self,
        scope: &Scope,
        domain: &str,
        event: &Event,
        ctx: &PipelineContext,
        results: &mut ProcessingResults,
    ) -> Result<Option<Decision>> {
        let Some(ioc) = self.iocs.lookup_domain(domain).await? else {
            return Ok(None);
        };
        results.ioc_host_matches += 1;

        let dedupe_key = ioc_key(&ioc.ioc_type, &ioc.value);

        if ctx.dry_run {
            if self.alert_once.peek(scope, &dedupe_key).await? {
                return Ok(Some(Decision::Deduped));
            }
            results.would_alert_ioc.push(ioc.value.clone());
            return Ok(Some(Decision::AlertCreated));
        }

        if self
            .alert_once
            .seen(scope, &dedupe_key, self.unknown_alert_ttl)
            .await?
        {
            return Ok(Some(Decision::Deduped));
        }

        self.alerts
            .create(
                CreateAlertRequest::builder()
                    .site_id(scope.site_id)
                    .rule_type("ioc-domain")
                    .severity("critical")
                    .title(format!("IOC domain contacted: {}", ioc.value))
                    .description(format!(
                        "Domain {domain} matches indicator {} during a probe of scope {}.",
                        ioc.value, scope.name
                    ))
                    .event_context(serde_json::json!({
                        "domain": domain,
                        "ioc_id": ioc.id,
                        "ioc_type": ioc.ioc_type,
                        "event_id": event.id,
                        "event_type": event.event_type,
                        "scope": scope.name,
                        "job_id": ctx.job_id,
                    }))
                    .build(),
            )
            .await?;
        results.alerts_created += 1;
        Ok(Some(Decision::AlertCreated))
    }

    /// Alert on downloaded files matching a hash indicator.
    async fn file_ioc_rule(
        &self,
        scope: &Scope,
        hash: &str,
        event: &Event,
        ctx: &PipelineContext,
        results: &mut ProcessingResults,
    ) -> Result<Option<Decision>> {
        let Some(ioc) = self.iocs.lookup_hash(hash).await? else {
            return Ok(None);
        };
        results.ioc_host_matches += 1;

        let dedupe_key = ioc_key(&ioc.ioc_type, &ioc.value);

        if ctx.dry_run {
            if self.alert_once.peek(scope, &dedupe_key).await? {
                return Ok(Some(Decision::Deduped));
            }
            results.would_alert_ioc.push(ioc.value.clone());
            return Ok(Some(Decision::AlertCreated));
        }

        if self
            .alert_once
            .seen(scope, &dedupe_key, self.unknown_alert_ttl)
            .await?
        {
            return Ok(Some(Decision::Deduped));
        }

        self.alerts
            .create(
                CreateAlertRequest::builder()
                    .site_id(scope.site_id)
                    .rule_type("ioc-hash")
                    .severity("critical")
                    .title(format!("IOC file hash observed: {}", ioc.value))
                    .description(format!(
                        "A downloaded file matches indicator {} during a probe of scope {}.",
                        ioc.value, scope.name
                    ))
                    .event_context(serde_json::json!({
                        "hash": hash,
                        "ioc_id": ioc.id,
                        "ioc_type": ioc.ioc_type,
                        "event_id": event.id,
                        "event_type": event.event_type,
                        "scope": scope.name,
                        "job_id": ctx.job_id,
                    }))
                    .build(),
            )
            .await?;
        results.alerts_created += 1;
        Ok(Some(Decision::AlertCreated))
    }
}
