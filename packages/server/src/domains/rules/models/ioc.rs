//! Indicators of compromise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Ioc {
    pub id: Uuid,
    pub ioc_type: String,
    pub value: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Ioc {
    pub fn domain(value: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            ioc_type: "domain".to_string(),
            value: value.into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn hash(value: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            ioc_type: "hash".to_string(),
            value: value.into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    // ========================================================================
    // SQL Queries - ALL queries must be in models/
    // ========================================================================

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO iocs (id, ioc_type, value, enabled, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.ioc_type)
        .bind(&self.value)
        .bind(self.enabled)
        .bind(self.created_at)
        .fetch_one(db)
        .await
    }

    /// Active indicator matching this domain, if any.
    pub async fn find_domain_match<'e>(
        domain: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM iocs
            WHERE ioc_type = 'domain' AND value = $1 AND enabled = TRUE
            LIMIT 1
            "#,
        )
        .bind(domain)
        .fetch_optional(db)
        .await
    }

    /// Active indicator matching this file hash, if any.
    pub async fn find_hash_match<'e>(
        hash: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM iocs
            WHERE ioc_type = 'hash' AND value = $1 AND enabled = TRUE
            LIMIT 1
            "#,
        )
        .bind(hash)
        .fetch_optional(db)
        .await
    }
}
