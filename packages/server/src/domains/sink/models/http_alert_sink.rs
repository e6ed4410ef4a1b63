//! HTTP alert sink configuration.
//!
//! A sink describes where and how alert payloads get POSTed: method, URI,
//! optional body transform, headers and query params, all of which may
//! reference secrets as `__NAME__` placeholders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;

use crate::common::SinkId;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct HttpAlertSink {
    pub id: SinkId,
    pub name: String,
    pub method: String,
    pub uri: String,
    /// Body transform expression (path/projection over the JSON payload).
    /// Empty means "send the payload as-is".
    pub body: Option<String>,
    /// Either a JSON object or newline-delimited `Key: Value` lines.
    pub headers: Option<String>,
    pub query_params: Option<String>,
    /// HTTP status treated as success; defaults to 200 when unset.
    pub ok_status: Option<i32>,
    pub retry: i32,
    pub secrets: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HttpAlertSink {
    // ========================================================================
    // SQL Queries - ALL queries must be in models/
    // ========================================================================

    pub async fn find_by_id<'e>(
        id: SinkId,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM http_alert_sinks WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO http_alert_sinks (
                id, name, method, uri, body, headers, query_params,
                ok_status, retry, secrets, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.method)
        .bind(&self.uri)
        .bind(&self.body)
        .bind(&self.headers)
        .bind(&self.query_params)
        .bind(self.ok_status)
        .bind(self.retry)
        .bind(&self.secrets)
        .fetch_one(db)
        .await
    }

    pub async fn delete<'e>(id: SinkId, db: impl PgExecutor<'e>) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM http_alert_sinks WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
