//! Monitored site - a target the platform runs scripted browser probes
//! against on a fixed cadence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;

use crate::common::{SinkId, SiteId, SourceId};

/// Whether alerts for a site are delivered or only recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "alert_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertMode {
    #[default]
    Active,
    Muted,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub enabled: bool,
    pub run_every_minutes: i32,
    pub source_id: SourceId,
    pub http_alert_sink_id: Option<SinkId>,
    pub alert_mode: AlertMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    /// Scheduler task name for this site's recurring probe.
    pub fn task_name(&self) -> String {
        format!("site:{}", self.id)
    }

    // ========================================================================
    // SQL Queries - ALL queries must be in models/
    // ========================================================================

    pub async fn find_by_id<'e>(id: SiteId, db: impl PgExecutor<'e>) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM sites WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO sites (
                id, name, enabled, run_every_minutes, source_id,
                http_alert_sink_id, alert_mode, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(self.enabled)
        .bind(self.run_every_minutes)
        .bind(self.source_id)
        .bind(self.http_alert_sink_id)
        .bind(self.alert_mode)
        .fetch_one(db)
        .await
    }

    pub async fn update<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE sites
            SET name = $2,
                enabled = $3,
                run_every_minutes = $4,
                source_id = $5,
                http_alert_sink_id = $6,
                alert_mode = $7,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(self.enabled)
        .bind(self.run_every_minutes)
        .bind(self.source_id)
        .bind(self.http_alert_sink_id)
        .bind(self.alert_mode)
        .fetch_one(db)
        .await
    }

    pub async fn delete<'e>(id: SiteId, db: impl PgExecutor<'e>) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM sites WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_enabled<'e>(db: impl PgExecutor<'e>) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM sites WHERE enabled = TRUE ORDER BY created_at")
            .fetch_all(db)
            .await
    }
}
