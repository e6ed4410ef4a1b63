//! Alert creation and lifecycle.
//!
//! Creation resolves the site's alert mode once and stamps it onto the row
//! as the delivery status. Dispatch is handed off to a detached task that
//! keeps the caller's tracing span but not its deadline: a cancelled request
//! must not cancel delivery of an alert that was already created. Dispatch
//! failures are logged, never surfaced to the creator.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, warn, Instrument};

use super::dispatcher::AlertDispatcher;
use super::models::{Alert, AlertStats, CreateAlertRequest, DeliveryStatus, ListAlertsOptions};
use crate::common::{AlertId, SiteId};
use crate::domains::site::{AlertMode, Site};

pub struct AlertService {
    pool: PgPool,
    dispatcher: Option<Arc<AlertDispatcher>>,
}

impl AlertService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            dispatcher: None,
        }
    }

    /// Attach the dispatcher; without one, alerts are recorded but never
    /// scheduled for delivery.
    pub fn with_dispatcher(mut self, dispatcher: Arc<AlertDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Create an alert and asynchronously schedule its delivery.
    pub async fn create(&self, req: CreateAlertRequest) -> Result<Alert> {
        let mode = self.resolve_alert_mode(req.site_id).await?;
        let delivery_status = match mode {
            AlertMode::Muted => DeliveryStatus::Muted,
            AlertMode::Active => DeliveryStatus::Pending,
        };

        let alert = Alert::from_request(req, delivery_status)
            .insert(&self.pool)
            .await
            .context("create alert")?;

        if delivery_status == DeliveryStatus::Muted {
            return Ok(alert);
        }

        if let Some(dispatcher) = &self.dispatcher {
            let dispatcher = dispatcher.clone();
            let dispatched = alert.clone();
            // Detached: keeps the request's span for log correlation, drops
            // its cancellation deadline.
            let span = tracing::Span::current();
            tokio::spawn(
                async move {
                    if let Err(e) = dispatcher.dispatch(&dispatched).await {
                        error!(alert_id = %dispatched.id, error = %e, "alert dispatch failed");
                    }
                }
                .instrument(span),
            );
        }

        Ok(alert)
    }

    /// Site's current alert mode; a missing site defaults to active.
    async fn resolve_alert_mode(&self, site_id: SiteId) -> Result<AlertMode> {
        match Site::find_by_id(site_id, &self.pool).await {
            Ok(Some(site)) => Ok(site.alert_mode),
            Ok(None) => Ok(AlertMode::Active),
            Err(e) => {
                warn!(site_id = %site_id, error = %e, "alert mode lookup failed, defaulting to active");
                Ok(AlertMode::Active)
            }
        }
    }

    pub async fn resolve(&self, id: AlertId, resolved_by: &str) -> Result<Option<Alert>> {
        Alert::resolve(id, resolved_by, &self.pool)
            .await
            .with_context(|| format!("resolve alert {id}"))
    }

    pub async fn get_by_id(&self, id: AlertId) -> Result<Option<Alert>> {
        Alert::find_by_id(id, &self.pool)
            .await
            .with_context(|| format!("get alert {id}"))
    }

    pub async fn list(&self, opts: ListAlertsOptions) -> Result<Vec<Alert>> {
        Alert::list(&opts, &self.pool).await.context("list alerts")
    }

    pub async fn delete(&self, id: AlertId) -> Result<bool> {
        Alert::delete(id, &self.pool)
            .await
            .with_context(|| format!("delete alert {id}"))
    }

    pub async fn stats(&self, site_id: Option<SiteId>) -> Result<AlertStats> {
        Alert::stats(site_id, &self.pool)
            .await
            .context("alert stats")
    }
}
