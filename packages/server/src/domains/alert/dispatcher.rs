//! Asynchronous alert delivery scheduling.
//!
//! The dispatcher performs no HTTP. It resolves the alert's site to its
//! configured sink, enriches the payload with the site name and a link back
//! to the alert, and enqueues one alert-delivery job per target sink. The
//! external HTTP sink worker consumes those jobs.
//!
//! Missing configuration is not an error from the caller's point of view: a
//! site without a sink, or a sink row that was deleted, means "nothing to
//! deliver" and is logged at debug/warn.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::Alert;
use crate::domains::site::{AlertMode, Site};
use crate::domains::sink::HttpAlertSink;
use crate::kernel::jobs::{Job, JobRepo, JobType};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("alert sink scheduler not configured")]
    SinkSchedulerNotConfigured,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Enriched payload handed to the HTTP sink worker.
#[derive(Debug, Clone, Serialize)]
pub struct SinkPayload {
    pub alert: serde_json::Value,
    pub site_name: String,
    pub alert_url: String,
}

pub struct AlertDispatcher {
    pool: PgPool,
    base_url: String,
    sink_scheduler: Option<Arc<dyn JobRepo>>,
}

impl AlertDispatcher {
    pub fn new(pool: PgPool, base_url: impl Into<String>) -> Self {
        Self {
            pool,
            base_url: base_url.into(),
            sink_scheduler: None,
        }
    }

    /// Attach the job repo used to enqueue alert-delivery jobs.
    pub fn with_sink_scheduler(mut self, repo: Arc<dyn JobRepo>) -> Self {
        self.sink_scheduler = Some(repo);
        self
    }

    /// Schedule delivery jobs for one alert.
    pub async fn dispatch(&self, alert: &Alert) -> Result<(), DispatchError> {
        let Some(repo) = &self.sink_scheduler else {
            return Err(DispatchError::SinkSchedulerNotConfigured);
        };

        let site = Site::find_by_id(alert.site_id, &self.pool)
            .await
            .context("load site for dispatch")?;
        let Some(site) = site else {
            debug!(alert_id = %alert.id, site_id = %alert.site_id, "site not found, skipping dispatch");
            return Ok(());
        };

        if site.alert_mode == AlertMode::Muted {
            debug!(alert_id = %alert.id, site_id = %site.id, "site muted, skipping dispatch");
            return Ok(());
        }

        let Some(sink_id) = site.http_alert_sink_id else {
            debug!(alert_id = %alert.id, site_id = %site.id, "site has no alert sink configured");
            return Ok(());
        };

        let sink = HttpAlertSink::find_by_id(sink_id, &self.pool)
            .await
            .context("load sink for dispatch")?;
        let Some(sink) = sink else {
            warn!(alert_id = %alert.id, sink_id = %sink_id, "configured sink no longer exists");
            return Ok(());
        };

        let payload = SinkPayload {
            alert: serde_json::to_value(alert).context("encode alert")?,
            site_name: site.name.clone(),
            alert_url: format!("{}/alerts/{}", self.base_url.trim_end_matches('/'), alert.id),
        };

        let targets = vec![sink];
        let mut scheduled = 0usize;
        let mut last_error: Option<anyhow::Error> = None;

        for sink in &targets {
            let job = Job::builder()
                .job_type(JobType::Alert)
                .payload(serde_json::json!({
                    "sink_id": sink.id,
                    "payload": &payload,
                }))
                .max_retries(sink.retry)
                .site_id(site.id)
                .build();

            match repo.create(job).await {
                Ok(_) => scheduled += 1,
                Err(e) => {
                    warn!(alert_id = %alert.id, sink_id = %sink.id, error = %e, "failed to schedule delivery job");
                    last_error = Some(e);
                }
            }
        }

        if scheduled == 0 {
            if let Some(e) = last_error {
                return Err(DispatchError::Other(
                    e.context(format!("schedule delivery for alert {}", alert.id)),
                ));
            }
        } else {
            info!(alert_id = %alert.id, scheduled, "alert delivery scheduled");
        }
        Ok(())
    }
}
