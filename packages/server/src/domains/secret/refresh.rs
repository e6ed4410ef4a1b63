//! Dynamic secret refresh.
//!
//! Secrets with `refresh_enabled` get a `secret-refresh:<id>` scheduled task
//! that enqueues refresh jobs on their interval. Executing a refresh runs
//! the admin-vetted provider script in a subprocess with the parent
//! environment plus the secret's `env_config`; trimmed stdout becomes the
//! new value and the outcome lands in the secret's status columns either way.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::PgPool;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::models::Secret;
use crate::common::SecretId;
use crate::kernel::jobs::{Job, JobHandler, JobRepo, JobStates, JobType};
use crate::kernel::scheduler::{
    OverrunPolicy, ScheduledTaskDefinition, ScheduledTaskStore, SECRET_REFRESH_PREFIX,
};
use crate::kernel::ServerDeps;

/// Default wall-clock budget for one provider script run.
const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

pub fn refresh_task_name(secret_id: SecretId) -> String {
    format!("{SECRET_REFRESH_PREFIX}{secret_id}")
}

pub struct SecretRefreshScheduler {
    pool: PgPool,
    store: ScheduledTaskStore,
    repo: Arc<dyn JobRepo>,
    script_timeout: Duration,
}

impl SecretRefreshScheduler {
    pub fn new(pool: PgPool, store: ScheduledTaskStore, repo: Arc<dyn JobRepo>) -> Self {
        Self {
            pool,
            store,
            repo,
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    /// Bring the refresh task for this secret in line with its settings.
    ///
    /// Disabled secrets lose both their task and any refresh jobs still
    /// queued for them.
    pub async fn reconcile_schedule(&self, secret: &Secret) -> Result<()> {
        let task_name = refresh_task_name(secret.id);

        if !secret.refresh_enabled {
            if self.store.delete(&task_name).await? {
                info!(secret_id = %secret.id, "removed refresh task for disabled secret");
            }
            let purged = self
                .repo
                .delete_by_payload_field(
                    JobType::SecretRefresh,
                    "secret_id",
                    &secret.id.to_string(),
                )
                .await?;
            if purged > 0 {
                info!(secret_id = %secret.id, purged, "purged queued refresh jobs");
            }
            return Ok(());
        }

        let Some(_script) = secret.provider_script_path.as_deref() else {
            bail!("secret {} has refresh enabled but no provider script", secret.id);
        };
        let interval_secs = secret
            .refresh_interval_secs
            .filter(|secs| *secs > 0)
            .ok_or_else(|| {
                anyhow!("secret {} has refresh enabled but no refresh interval", secret.id)
            })?;

        let definition = ScheduledTaskDefinition {
            task_name,
            payload: serde_json::json!({ "secret_id": secret.id }),
            interval: Duration::from_secs(interval_secs as u64),
            overrun_policy: Some(OverrunPolicy::Skip),
            overrun_states: Some(JobStates::RUNNING | JobStates::PENDING | JobStates::RETRYING),
        };
        self.store
            .upsert(&definition)
            .await
            .with_context(|| format!("reconcile refresh task for secret {}", secret.id))?;
        info!(secret_id = %secret.id, interval_secs, "refresh task reconciled");
        Ok(())
    }

    /// Run the provider script and persist the outcome.
    pub async fn execute_refresh(&self, secret_id: SecretId) -> Result<()> {
        let secret = Secret::find_by_id(secret_id, &self.pool)
            .await
            .context("load secret")?
            .ok_or_else(|| anyhow!("secret {secret_id} not found"))?;

        if !secret.refresh_enabled {
            bail!("refresh is disabled for secret {secret_id}");
        }
        let script_path = secret
            .provider_script_path
            .as_deref()
            .ok_or_else(|| anyhow!("secret {secret_id} has no provider script"))?;

        let output = match self.run_provider_script(script_path, &secret).await {
            Ok(output) => output,
            Err(e) => {
                let message = e.to_string();
                Secret::record_refresh_failure(secret_id, &message, &self.pool)
                    .await
                    .context("record refresh failure")?;
                return Err(e.context(format!("refresh secret {secret_id}")));
            }
        };

        Secret::record_refresh_success(secret_id, &output, &self.pool)
            .await
            .context("record refresh success")?;
        info!(secret_id = %secret_id, "secret refreshed");
        Ok(())
    }

    /// Execute the script; returns trimmed stdout on success.
    async fn run_provider_script(&self, script_path: &str, secret: &Secret) -> Result<String> {
        let mut command = Command::new(script_path);
        command
            .envs(secret.provider_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.script_timeout, command.output())
            .await
            .map_err(|_| {
                anyhow!(
                    "provider script timed out after {}s",
                    self.script_timeout.as_secs()
                )
            })?
            .with_context(|| format!("spawn provider script {script_path}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            bail!("provider script exited with {code}: {}", stderr.trim());
        }

        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            bail!("provider script produced no output");
        }
        Ok(value)
    }
}

// =============================================================================
// Job handler
// =============================================================================

#[derive(Debug, Deserialize)]
struct RefreshPayload {
    secret_id: SecretId,
}

/// Executes `secret_refresh` jobs enqueued by the scheduler.
pub struct SecretRefreshHandler {
    scheduler: Arc<SecretRefreshScheduler>,
}

impl SecretRefreshHandler {
    pub fn new(scheduler: Arc<SecretRefreshScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl JobHandler for SecretRefreshHandler {
    async fn execute(&self, job: &Job, _deps: Arc<ServerDeps>) -> Result<()> {
        let payload: RefreshPayload =
            serde_json::from_value(job.payload.clone()).context("parse refresh payload")?;

        if job.is_test {
            warn!(job_id = %job.id, "skipping refresh for test job");
            return Ok(());
        }

        self.scheduler.execute_refresh(payload.secret_id).await
    }
}
