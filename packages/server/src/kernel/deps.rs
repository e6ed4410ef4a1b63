//! Server dependencies for the control plane (using traits for testability)
//!
//! This module provides the central dependency container handed to every
//! service and domain function. All external collaborators sit behind trait
//! abstractions so tests can swap in mocks.

use sqlx::PgPool;
use std::sync::Arc;

use super::cache::InMemorySharedCache;
use super::http::TestHttpSender;
use super::notify::{BaseJobNotifier, TestJobNotifier};
use super::traits::{BaseHttpSender, BaseSharedCache};

/// Dependencies accessible to services and domain functions.
#[derive(Clone)]
pub struct ServerDeps {
    pub db_pool: PgPool,
    /// Replica-visible key-value cache (Redis-compatible in production).
    pub shared_cache: Arc<dyn BaseSharedCache>,
    /// Best-effort job wakeup publisher.
    pub notifier: Arc<dyn BaseJobNotifier>,
    /// Outbound HTTP for sink test fires.
    pub http_sender: Arc<dyn BaseHttpSender>,
    /// Public base URL used to build alert links in sink payloads.
    pub base_url: String,
}

impl ServerDeps {
    /// Create new ServerDeps with the given dependencies
    pub fn new(
        db_pool: PgPool,
        shared_cache: Arc<dyn BaseSharedCache>,
        notifier: Arc<dyn BaseJobNotifier>,
        http_sender: Arc<dyn BaseHttpSender>,
        base_url: String,
    ) -> Self {
        Self {
            db_pool,
            shared_cache,
            notifier,
            http_sender,
            base_url,
        }
    }

    /// Deps wired with in-process mocks. Every external collaborator is a
    /// recording fake; only the database is real.
    pub fn for_tests(db_pool: PgPool) -> Self {
        Self {
            db_pool,
            shared_cache: Arc::new(InMemorySharedCache::new()),
            notifier: Arc::new(TestJobNotifier::new()),
            http_sender: Arc::new(TestHttpSender::new()),
            base_url: "http://localhost:8080".to_string(),
        }
    }
}
