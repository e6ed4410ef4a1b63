//! Job handler registry.
//!
//! Maps job types to handlers. Only job types the control plane itself
//! executes are registered here (rules evaluation, secret refresh); browser
//! and alert-delivery jobs are consumed by external workers and simply have
//! no in-process handler.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::job::{Job, JobType};
use crate::kernel::ServerDeps;

/// Executes one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job, deps: Arc<ServerDeps>) -> Result<()>;
}

/// Registry of handlers keyed by job type.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any existing one.
    pub fn register(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn handler_for(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Job types this process will claim.
    pub fn handled_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}
