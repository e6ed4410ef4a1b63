//! Probe source - the script a browser worker runs against a site.
//!
//! Scripts may reference secrets through `__NAME__` placeholders; resolution
//! happens at enqueue time so workers only ever see fully-resolved scripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use std::collections::HashMap;

use crate::common::SourceId;
use crate::domains::secret::{substitute_placeholders, Secret};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub value: String,
    /// Names of the secrets this script references.
    pub secrets: Vec<String>,
    pub test: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    // ========================================================================
    // SQL Queries - ALL queries must be in models/
    // ========================================================================

    pub async fn find_by_id<'e>(
        id: SourceId,
        db: impl PgExecutor<'e>,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM sources WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn insert<'e>(&self, db: impl PgExecutor<'e>) -> sqlx::Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO sources (id, name, value, secrets, test, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.value)
        .bind(&self.secrets)
        .bind(self.test)
        .fetch_one(db)
        .await
    }

    pub async fn delete<'e>(id: SourceId, db: impl PgExecutor<'e>) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Resolve a script's placeholders against a set of secret rows.
pub fn resolve_script(source: &Source, secrets: Vec<Secret>) -> String {
    if source.secrets.is_empty() {
        return source.value.clone();
    }
    let values: HashMap<String, String> =
        secrets.into_iter().map(|s| (s.name, s.value)).collect();
    substitute_placeholders(&source.value, &values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SecretId;

    fn source_with(value: &str, secrets: Vec<&str>) -> Source {
        Source {
            id: SourceId::new(),
            name: "probe".to_string(),
            value: value.to_string(),
            secrets: secrets.into_iter().map(String::from).collect(),
            test: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn secret(name: &str, value: &str) -> Secret {
        Secret {
            id: SecretId::new(),
            name: name.to_string(),
            value: value.to_string(),
            refresh_enabled: false,
            provider_script_path: None,
            refresh_interval_secs: None,
            env_config: serde_json::json!({}),
            last_refresh_status: None,
            last_refreshed_at: None,
            last_refresh_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn resolve_script_substitutes_named_secrets() {
        let source = source_with("login('__USER__', '__PASS__')", vec!["USER", "PASS"]);
        let resolved = resolve_script(&source, vec![secret("USER", "u"), secret("PASS", "p")]);
        assert_eq!(resolved, "login('u', 'p')");
    }

    #[test]
    fn resolve_script_without_secrets_is_identity() {
        let source = source_with("visit('https://example.com')", vec![]);
        let resolved = resolve_script(&source, vec![]);
        assert_eq!(resolved, "visit('https://example.com')");
    }
}
