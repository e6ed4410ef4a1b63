//! Row builders for integration tests.

use chrono::Utc;
use server_core::common::{SecretId, SinkId, SiteId, SourceId};
use server_core::domains::secret::Secret;
use server_core::domains::sink::HttpAlertSink;
use server_core::domains::site::{AlertMode, Site};
use server_core::domains::source::Source;
use sqlx::PgPool;

pub async fn seed_source(pool: &PgPool) -> Source {
    Source {
        id: SourceId::new(),
        name: format!("probe-{}", SourceId::new()),
        value: "visit('https://example.com')".to_string(),
        secrets: vec![],
        test: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
    .insert(pool)
    .await
    .expect("insert source")
}

pub async fn seed_site(pool: &PgPool, sink_id: Option<SinkId>, alert_mode: AlertMode) -> Site {
    let source = seed_source(pool).await;
    Site {
        id: SiteId::new(),
        name: format!("site-{}", SiteId::new()),
        enabled: true,
        run_every_minutes: 30,
        source_id: source.id,
        http_alert_sink_id: sink_id,
        alert_mode,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
    .insert(pool)
    .await
    .expect("insert site")
}

pub async fn seed_sink(pool: &PgPool, retry: i32) -> HttpAlertSink {
    HttpAlertSink {
        id: SinkId::new(),
        name: format!("sink-{}", SinkId::new()),
        method: "POST".to_string(),
        uri: "https://hooks.example.com/alert".to_string(),
        body: None,
        headers: None,
        query_params: None,
        ok_status: None,
        retry,
        secrets: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
    .insert(pool)
    .await
    .expect("insert sink")
}

pub async fn seed_secret(pool: &PgPool, name: &str, value: &str) -> Secret {
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
    .insert(pool)
    .await
    .expect("insert secret")
}
