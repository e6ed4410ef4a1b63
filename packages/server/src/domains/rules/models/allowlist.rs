//! Domain allowlist entries.
//!
//! A row with `site_id` scopes the allow to one site; a row without applies
//! globally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::SiteId;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DomainAllowlist {
    pub id: Uuid,
    pub site_id: Option<SiteId>,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

impl DomainAllowlist {
    pub fn global(domain: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            site_id: None,
            domain: domain.into(),
            created_at: Utc::now(),
        }
    }

    pub fn for_site(site_id: SiteId, domain: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            site_id: Some(site_id),
            domain: domain.into(),
            created_at: Utc::now(),
        }
    }

    // ========================================================================
    // SQL Queries - ALL queries must be in models/
    // ========================================================================

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO domain_allowlists (id, site_id, domain, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.site_id)
        .bind(&self.domain)
        .bind(self.created_at)
        .fetch_one(db)
        .await
    }

    /// Whether a domain is allowed for a site (site-scoped or global row).
    pub async fn is_allowlisted<'e>(
        site_id: SiteId,
        domain: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<bool> {
        let allowed: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM domain_allowlists
                WHERE domain = $2 AND (site_id IS NULL OR site_id = $1)
            )
            "#,
        )
        .bind(site_id)
        .bind(domain)
        .fetch_one(db)
        .await?;
        Ok(allowed)
    }
}
