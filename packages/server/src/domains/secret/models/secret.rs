//! Named secrets referenced by probe scripts and alert sinks.
//!
//! Values are stored plaintext and treated as sensitive everywhere else:
//! they never reach logs, and redactors substitute them back to
//! `__NAME__` placeholders before any output that could persist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use std::collections::HashMap;

use crate::common::SecretId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "refresh_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Success,
    Failed,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: SecretId,
    pub name: String,
    pub value: String,
    pub refresh_enabled: bool,
    pub provider_script_path: Option<String>,
    pub refresh_interval_secs: Option<i64>,
    pub env_config: serde_json::Value,
    pub last_refresh_status: Option<RefreshStatus>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_refresh_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    /// The `__NAME__` placeholder this secret substitutes.
    pub fn placeholder(&self) -> String {
        format!("__{}__", self.name)
    }

    /// Extra environment for the provider script, from `env_config`.
    pub fn provider_env(&self) -> HashMap<String, String> {
        match self.env_config.as_object() {
            Some(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            None => HashMap::new(),
        }
    }

    // ========================================================================
    // SQL Queries - ALL queries must be in models/
    // ========================================================================

    pub async fn find_by_id<'e>(
        id: SecretId,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM secrets WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_by_name<'e>(
        name: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM secrets WHERE name = $1")
            .bind(name)
            .fetch_optional(db)
            .await
    }

    /// Fetch several secrets by name in one round trip.
    pub async fn find_by_names<'e>(
        names: &[String],
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM secrets WHERE name = ANY($1)")
            .bind(names)
            .fetch_all(db)
            .await
    }

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO secrets (
                id, name, value, refresh_enabled, provider_script_path,
                refresh_interval_secs, env_config, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.value)
        .bind(self.refresh_enabled)
        .bind(&self.provider_script_path)
        .bind(self.refresh_interval_secs)
        .bind(&self.env_config)
        .fetch_one(db)
        .await
    }

    /// Record a successful refresh: new value plus status bookkeeping.
    pub async fn record_refresh_success<'e>(
        id: SecretId,
        value: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE secrets
            SET value = $2,
                last_refresh_status = 'success',
                last_refreshed_at = NOW(),
                last_refresh_error = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(value)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Record a failed refresh attempt; the current value is kept.
    pub async fn record_refresh_failure<'e>(
        id: SecretId,
        error: &str,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE secrets
            SET last_refresh_status = 'failed',
                last_refreshed_at = NOW(),
                last_refresh_error = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn delete<'e>(id: SecretId, db: impl PgExecutor<'e>) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM secrets WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Substitute `__NAME__` placeholders in `input` for each secret value.
///
/// Substitution is literal; no URL-encoding is applied, so templates must be
/// written for the context they target.
pub fn substitute_placeholders(input: &str, values: &HashMap<String, String>) -> String {
    let mut output = input.to_string();
    for (name, value) in values {
        output = output.replace(&format!("__{name}__"), value);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_wraps_name() {
        let secret = Secret {
            id: SecretId::new(),
            name: "API_TOKEN".to_string(),
            value: "s3cret".to_string(),
            refresh_enabled: false,
            provider_script_path: None,
            refresh_interval_secs: None,
            env_config: serde_json::json!({}),
            last_refresh_status: None,
            last_refreshed_at: None,
            last_refresh_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(secret.placeholder(), "__API_TOKEN__");
    }

    #[test]
    fn substitute_replaces_all_occurrences() {
        let mut values = HashMap::new();
        values.insert("T".to_string(), "abc".to_string());
        let out = substitute_placeholders("x=__T__&y=__T__", &values);
        assert_eq!(out, "x=abc&y=abc");
    }

    #[test]
    fn substitute_leaves_unknown_placeholders() {
        let values = HashMap::new();
        assert_eq!(substitute_placeholders("x=__MISSING__", &values), "x=__MISSING__");
    }

    #[test]
    fn provider_env_reads_string_pairs() {
        let secret = Secret {
            id: SecretId::new(),
            name: "t".to_string(),
            value: "v".to_string(),
            refresh_enabled: true,
            provider_script_path: Some("/opt/refresh.sh".to_string()),
            refresh_interval_secs: Some(3600),
            env_config: serde_json::json!({"VAULT_ADDR": "https://vault", "IGNORED": 42}),
            last_refresh_status: None,
            last_refreshed_at: None,
            last_refresh_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let env = secret.provider_env();
        assert_eq!(env.get("VAULT_ADDR").map(String::as_str), Some("https://vault"));
        assert!(!env.contains_key("IGNORED"));
    }
}
