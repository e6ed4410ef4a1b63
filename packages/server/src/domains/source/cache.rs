//! Resolved-script cache.
//!
//! The scheduler resolves a source's script (placeholders included) once per
//! cache window instead of on every firing. Resolved scripts contain secret
//! values, so they live in the shared cache only, keyed by source ID, with a
//! short TTL that bounds staleness after a secret rotation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::models::{resolve_script, Source};
use crate::common::SourceId;
use crate::domains::secret::Secret;
use crate::kernel::scheduler::ScriptResolver;
use crate::kernel::traits::BaseSharedCache;

const DEFAULT_SCRIPT_TTL: Duration = Duration::from_secs(300);

fn script_key(source_id: SourceId) -> String {
    format!("source_script:{source_id}")
}

pub struct SourceCache {
    pool: PgPool,
    shared: Arc<dyn BaseSharedCache>,
    ttl: Duration,
}

impl SourceCache {
    pub fn new(pool: PgPool, shared: Arc<dyn BaseSharedCache>) -> Self {
        Self {
            pool,
            shared,
            ttl: DEFAULT_SCRIPT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Load the source, resolve its secrets and cache the result.
    async fn load_and_resolve(&self, source_id: SourceId) -> Result<String> {
        let source = Source::find_by_id(source_id, &self.pool)
            .await
            .context("load source")?
            .ok_or_else(|| anyhow!("source {source_id} not found"))?;

        let secrets = Secret::find_by_names(&source.secrets, &self.pool)
            .await
            .context("load source secrets")?;
        let script = resolve_script(&source, secrets);

        // Best effort: a failed cache write only costs a re-resolve.
        if let Err(e) = self
            .shared
            .set(&script_key(source_id), &script, Some(self.ttl))
            .await
        {
            warn!(source_id = %source_id, error = %e, "script cache write failed");
        }
        Ok(script)
    }

    /// Drop the cached script, forcing re-resolution on next use.
    pub async fn invalidate(&self, source_id: SourceId) -> Result<()> {
        self.shared.delete(&script_key(source_id)).await
    }
}

#[async_trait]
impl ScriptResolver for SourceCache {
    async fn resolve_script(&self, source_id: SourceId) -> Result<String> {
        match self.shared.get(&script_key(source_id)).await {
            Ok(Some(script)) => return Ok(script),
            Ok(None) => {}
            Err(e) => warn!(source_id = %source_id, error = %e, "script cache read failed"),
        }
        self.load_and_resolve(source_id).await
    }
}
