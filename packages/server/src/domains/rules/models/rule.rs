//! Rule configuration rows.
//!
//! Rule behavior itself lives in the pipeline; these rows carry per-rule
//! tuning such as the alert-once TTL and an enable switch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use std::time::Duration;

use crate::common::RuleId;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub rule_type: String,
    pub enabled: bool,
    pub alert_ttl_secs: Option<i64>,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    /// Alert-once suppression window for this rule, if configured.
    pub fn alert_ttl(&self) -> Option<Duration> {
        self.alert_ttl_secs
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
    }

    pub async fn find_by_type<'e>(
        rule_type: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM rules WHERE rule_type = $1 AND enabled = TRUE LIMIT 1",
        )
        .bind(rule_type)
        .fetch_optional(db)
        .await
    }

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO rules (id, rule_type, enabled, alert_ttl_secs, config, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.rule_type)
        .bind(self.enabled)
        .bind(self.alert_ttl_secs)
        .bind(&self.config)
        .fetch_one(db)
        .await
    }
}
