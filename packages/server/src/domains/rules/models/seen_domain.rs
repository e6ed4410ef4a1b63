//! Durable seen-domain baseline, the bottom tier of the seen-domains cache.

use sqlx::postgres::PgExecutor;

use crate::common::SiteId;

pub struct SeenDomain;

impl SeenDomain {
    pub async fn exists<'e>(
        site_id: SiteId,
        scope: &str,
        domain: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM seen_domains
                WHERE site_id = $1 AND scope = $2 AND domain = $3
            )
            "#,
        )
        .bind(site_id)
        .bind(scope)
        .bind(domain)
        .fetch_one(db)
        .await
    }

    /// Idempotent: recording an already-seen domain is a no-op.
    pub async fn record<'e>(
        site_id: SiteId,
        scope: &str,
        domain: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO seen_domains (site_id, scope, domain)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(site_id)
        .bind(scope)
        .bind(domain)
        .execute(db)
        .await?;
        Ok(())
    }
}
