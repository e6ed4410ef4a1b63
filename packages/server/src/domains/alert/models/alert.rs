//! Alert rows produced by rule evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{AlertId, RuleId, SiteId};

/// Whether an alert should be delivered to the site's sink.
///
/// Resolved once, at creation time, from the site's current alert mode; a
/// site un-muted later does not retroactively deliver old alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Muted,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub site_id: SiteId,
    pub rule_id: Option<RuleId>,
    pub rule_type: String,
    pub severity: String,
    pub title: String,
    pub description: String,
    pub event_context: serde_json::Value,
    pub fired_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an alert.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CreateAlertRequest {
    pub site_id: SiteId,
    #[builder(default, setter(strip_option))]
    pub rule_id: Option<RuleId>,
    pub rule_type: String,
    pub severity: String,
    pub title: String,
    #[builder(default)]
    pub description: String,
    #[builder(default = serde_json::json!({}))]
    pub event_context: serde_json::Value,
}

/// Alert counters for a site (or the whole store).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AlertStats {
    pub total: i64,
    pub unresolved: i64,
    pub muted: i64,
}

/// Filter for listing alerts.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ListAlertsOptions {
    #[builder(default, setter(strip_option))]
    pub site_id: Option<SiteId>,
    #[builder(default, setter(strip_option))]
    pub unresolved_only: Option<bool>,
    #[builder(default = 100)]
    pub limit: i64,
    #[builder(default = 0)]
    pub offset: i64,
}

impl Alert {
    pub fn from_request(req: CreateAlertRequest, delivery_status: DeliveryStatus) -> Self {
        let now = Utc::now();
        Self {
            id: AlertId::new(),
            site_id: req.site_id,
            rule_id: req.rule_id,
            rule_type: req.rule_type,
            severity: req.severity,
            title: req.title,
            description: req.description,
            event_context: req.event_context,
            fired_at: now,
            resolved_at: None,
            resolved_by: None,
            delivery_status,
            created_at: now,
        }
    }

    // ========================================================================
    // SQL Queries - ALL queries must be in models/
    // ========================================================================

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO alerts (
                id, site_id, rule_id, rule_type, severity, title, description,
                event_context, fired_at, delivery_status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.site_id)
        .bind(self.rule_id)
        .bind(&self.rule_type)
        .bind(&self.severity)
        .bind(&self.title)
        .bind(&self.description)
        .bind(&self.event_context)
        .bind(self.fired_at)
        .bind(self.delivery_status)
        .bind(self.created_at)
        .fetch_one(db)
        .await
    }

    pub async fn find_by_id<'e>(
        id: AlertId,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Mark resolved. Returns the updated row, or `None` when absent.
    pub async fn resolve<'e>(
        id: AlertId,
        resolved_by: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE alerts
            SET resolved_at = NOW(), resolved_by = $2
            WHERE id = $1 AND resolved_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(resolved_by)
        .fetch_optional(db)
        .await
    }

    pub async fn delete<'e>(id: AlertId, db: impl PgExecutor<'e>) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM alerts WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list<'e>(
        opts: &ListAlertsOptions,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Vec<Self>> {
        let mut builder = sqlx::QueryBuilder::new("SELECT * FROM alerts WHERE TRUE");
        if let Some(site_id) = opts.site_id {
            builder.push(" AND site_id = ").push_bind(site_id);
        }
        if opts.unresolved_only == Some(true) {
            builder.push(" AND resolved_at IS NULL");
        }
        builder
            .push(" ORDER BY fired_at DESC, id DESC LIMIT ")
            .push_bind(opts.limit)
            .push(" OFFSET ")
            .push_bind(opts.offset);

        builder.build_query_as::<Self>().fetch_all(db).await
    }

    pub async fn stats<'e>(
        site_id: Option<SiteId>,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<AlertStats> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE resolved_at IS NULL),
                   COUNT(*) FILTER (WHERE delivery_status = 'muted')
            FROM alerts
            WHERE $1::uuid IS NULL OR site_id = $1
            "#,
        )
        .bind(site_id)
        .fetch_one(db)
        .await?;

        Ok(AlertStats {
            total: row.0,
            unresolved: row.1,
            muted: row.2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_request_stamps_fire_time_and_status() {
        let req = CreateAlertRequest::builder()
            .site_id(SiteId::new())
            .rule_type("unknown-domain")
            .severity("high")
            .title("Unknown domain observed: evil.example")
            .build();

        let alert = Alert::from_request(req, DeliveryStatus::Muted);
        assert_eq!(alert.delivery_status, DeliveryStatus::Muted);
        assert!(alert.resolved_at.is_none());
        assert_eq!(alert.fired_at, alert.created_at);
    }
}
