//! Alert evaluation caches.
//!
//! Two cache families, both keyed by `(scope, ...)` where a scope is a
//! `{site_id, scope_name}` partition:
//!
//! - **SeenDomainsCache** - tiered: process-local LRU, then the shared
//!   cache, then the durable `seen_domains` table. Hits back-fill the
//!   faster tiers. The store is authoritative; cache-tier writes are best
//!   effort and never fail the call.
//! - **AlertOnceCache** - single tier over the shared cache. `seen` is an
//!   atomic set-if-absent, which is what makes concurrent evaluations of
//!   the same domain produce exactly one alert.

use anyhow::{Context, Result};
use moka::sync::Cache;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::models::{Ioc, SeenDomain};
use crate::common::SiteId;
use crate::kernel::traits::BaseSharedCache;

/// Default alert-once suppression window.
pub const DEFAULT_ALERT_TTL: Duration = Duration::from_secs(60 * 60);

const LOCAL_SEEN_CAPACITY: u64 = 10_000;
const LOCAL_SEEN_TTL: Duration = Duration::from_secs(60);
const SHARED_SEEN_TTL: Duration = Duration::from_secs(60 * 60);
const IOC_LOOKUP_TTL: Duration = Duration::from_secs(60);

/// Logical partition inside a site bounding baselines and dedupe keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub site_id: SiteId,
    pub name: String,
}

impl Scope {
    pub fn new(site_id: SiteId, name: impl Into<String>) -> Self {
        Self {
            site_id,
            name: name.into(),
        }
    }

    fn seen_key(&self, domain: &str) -> String {
        format!("seen:{}:{}:{}", self.site_id, self.name, domain)
    }

    fn alert_once_key(&self, dedupe_key: &str) -> String {
        format!("alert_once:{}:{}:{}", self.site_id, self.name, dedupe_key)
    }
}

/// Dedupe key for unknown-domain alerts.
pub fn unknown_domain_key(domain: &str) -> String {
    format!("unknown:{domain}")
}

/// Dedupe key for IOC alerts.
pub fn ioc_key(ioc_type: &str, value: &str) -> String {
    format!("ioc:{ioc_type}:{value}")
}

// =============================================================================
// SeenDomainsCache
// =============================================================================

pub struct SeenDomainsCache {
    local: Cache<String, ()>,
    shared: Arc<dyn BaseSharedCache>,
    pool: PgPool,
}

impl SeenDomainsCache {
    pub fn new(pool: PgPool, shared: Arc<dyn BaseSharedCache>) -> Self {
        Self {
            local: Cache::builder()
                .max_capacity(LOCAL_SEEN_CAPACITY)
                .time_to_live(LOCAL_SEEN_TTL)
                .build(),
            shared,
            pool,
        }
    }

    /// Whether this domain has been seen for the scope.
    ///
    /// Consults local, then shared, then the store; hits populate the
    /// faster tiers. A miss everywhere means an unknown domain.
    pub async fn exists(&self, scope: &Scope, domain: &str) -> Result<bool> {
        let key = scope.seen_key(domain);

        if self.local.contains_key(&key) {
            return Ok(true);
        }

        match self.shared.exists(&key).await {
            Ok(true) => {
                self.local.insert(key, ());
                return Ok(true);
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "shared seen-domain read failed"),
        }

        let in_store = SeenDomain::exists(scope.site_id, &scope.name, domain, &self.pool)
            .await
            .context("seen-domain store read")?;

        if in_store {
            if let Err(e) = self.shared.set(&key, "1", Some(SHARED_SEEN_TTL)).await {
                warn!(error = %e, "shared seen-domain backfill failed");
            }
            self.local.insert(key, ());
        }
        Ok(in_store)
    }

    /// Record a domain as seen: store first, then the cache tiers.
    ///
    /// The store write is authoritative and its failure fails the call;
    /// cache-tier writes are best effort.
    pub async fn record(&self, scope: &Scope, domain: &str) -> Result<()> {
        SeenDomain::record(scope.site_id, &scope.name, domain, &self.pool)
            .await
            .context("seen-domain store write")?;

        let key = scope.seen_key(domain);
        if let Err(e) = self.shared.set(&key, "1", Some(SHARED_SEEN_TTL)).await {
            warn!(error = %e, "shared seen-domain write failed");
        }
        self.local.insert(key, ());
        Ok(())
    }
}

// =============================================================================
// AlertOnceCache
// =============================================================================

pub struct AlertOnceCache {
    shared: Arc<dyn BaseSharedCache>,
}

impl AlertOnceCache {
    pub fn new(shared: Arc<dyn BaseSharedCache>) -> Self {
        Self { shared }
    }

    /// Atomically claim this dedupe key for `ttl`.
    ///
    /// Returns `true` when the key was already claimed; the caller must
    /// suppress its alert.
    pub async fn seen(&self, scope: &Scope, dedupe_key: &str, ttl: Duration) -> Result<bool> {
        let created = self
            .shared
            .set_nx(&scope.alert_once_key(dedupe_key), "1", ttl)
            .await
            .context("alert-once claim")?;
        Ok(!created)
    }

    /// Read-only variant for dry-run previews; claims nothing.
    pub async fn peek(&self, scope: &Scope, dedupe_key: &str) -> Result<bool> {
        self.shared
            .exists(&scope.alert_once_key(dedupe_key))
            .await
            .context("alert-once peek")
    }
}

// =============================================================================
// IOC lookup cache
// =============================================================================

/// Read-through cache over the IOC store for hot lookups.
///
/// Keys are namespaced by indicator type so a domain and a hash with the
/// same text never collide.
pub struct IocLookupCache {
    pool: PgPool,
    cache: Cache<String, Option<Ioc>>,
}

impl IocLookupCache {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Cache::builder()
                .max_capacity(LOCAL_SEEN_CAPACITY)
                .time_to_live(IOC_LOOKUP_TTL)
                .build(),
        }
    }

    pub async fn lookup_domain(&self, domain: &str) -> Result<Option<Ioc>> {
        let key = format!("domain:{domain}");
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let found = Ioc::find_domain_match(domain, &self.pool)
            .await
            .context("IOC store lookup")?;
        self.cache.insert(key, found.clone());
        Ok(found)
    }

    pub async fn lookup_hash(&self, hash: &str) -> Result<Option<Ioc>> {
        let key = format!("hash:{hash}");
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let found = Ioc::find_hash_match(hash, &self.pool)
            .await
            .context("IOC store lookup")?;
        self.cache.insert(key, found.clone());
        Ok(found)
    }
}
