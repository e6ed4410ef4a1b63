//! Keeps each site's recurring probe task in sync with its settings.
//!
//! Enabling a site (or changing its cadence) upserts the `site:<id>`
//! scheduled task; disabling or deleting the site removes it. Reconciliation
//! is idempotent, so callers run it after every site mutation.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;

use super::models::Site;
use crate::common::SiteId;
use crate::kernel::scheduler::{ScheduledTaskDefinition, ScheduledTaskStore};

pub struct SiteTaskReconciler {
    store: ScheduledTaskStore,
}

impl SiteTaskReconciler {
    pub fn new(store: ScheduledTaskStore) -> Self {
        Self { store }
    }

    /// Bring the scheduled task for this site in line with its row.
    pub async fn reconcile(&self, site: &Site) -> Result<()> {
        let task_name = site.task_name();

        if !site.enabled {
            if self.store.delete(&task_name).await? {
                info!(site_id = %site.id, task = %task_name, "removed probe task for disabled site");
            }
            return Ok(());
        }

        let definition = ScheduledTaskDefinition::interval_task(
            task_name.clone(),
            serde_json::json!({
                "site_id": site.id,
                "source_id": site.source_id,
            }),
            Duration::from_secs(site.run_every_minutes as u64 * 60),
        );

        self.store
            .upsert(&definition)
            .await
            .with_context(|| format!("reconcile probe task for site {}", site.id))?;
        info!(
            site_id = %site.id,
            task = %task_name,
            run_every_minutes = site.run_every_minutes,
            "probe task reconciled"
        );
        Ok(())
    }

    /// Remove the task for a site that no longer exists.
    pub async fn remove(&self, site_id: SiteId) -> Result<()> {
        let task_name = format!("site:{site_id}");
        self.store.delete(&task_name).await?;
        Ok(())
    }
}
