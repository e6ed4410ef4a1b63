//! Sink compilation and test fires: secret substitution, header parsing,
//! body transforms, redaction.

mod common;

use chrono::Utc;
use common::fixtures::seed_secret;
use common::TestHarness;
use server_core::common::SinkId;
use server_core::domains::sink::{HttpAlertSink, SinkCompiler};
use server_core::kernel::{HttpResponse, TestHttpSender};
use std::collections::HashMap;
use std::sync::Arc;
use test_context::test_context;

fn sink_with(
    uri: &str,
    query_params: Option<&str>,
    headers: Option<&str>,
    body: Option<&str>,
    secrets: Vec<&str>,
) -> HttpAlertSink {
    HttpAlertSink {
        id: SinkId::new(),
        name: "webhook".to_string(),
        method: "post".to_string(),
        uri: uri.to_string(),
        body: body.map(String::from),
        headers: headers.map(String::from),
        query_params: query_params.map(String::from),
        ok_status: None,
        retry: 3,
        secrets: secrets.into_iter().map(String::from).collect(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn compile_substitutes_secrets_and_adds_content_type(harness: &mut TestHarness) {
    seed_secret(&harness.db_pool, "T", "abc").await;
    let sink = sink_with(
        "https://api.example.com/alert",
        Some("token=__T__"),
        Some("X-API: __T__\nAccept: application/json"),
        Some("$.foo"),
        vec!["T"],
    );

    let compiler = SinkCompiler::new(harness.db_pool.clone(), Arc::new(TestHttpSender::new()));
    let prepared = compiler
        .compile(&sink, &serde_json::json!({"foo": "bar"}))
        .await
        .expect("compile sink");

    assert_eq!(prepared.method, "POST");
    assert_eq!(prepared.url, "https://api.example.com/alert?token=abc");

    let headers: HashMap<_, _> = prepared.headers.iter().cloned().collect();
    assert_eq!(headers["X-API"], "abc");
    assert_eq!(headers["Accept"], "application/json");
    assert_eq!(headers["Content-Type"], "application/json");

    assert_eq!(prepared.body.as_deref(), Some(r#""bar""#));
    assert_eq!(prepared.ok_status, 200);
    assert_eq!(prepared.secrets.get("__T__").map(String::as_str), Some("abc"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn compile_without_body_expression_sends_raw_payload(harness: &mut TestHarness) {
    let sink = sink_with("https://api.example.com/alert", None, None, None, vec![]);
    let compiler = SinkCompiler::new(harness.db_pool.clone(), Arc::new(TestHttpSender::new()));

    let payload = serde_json::json!({"alert": {"title": "x"}});
    let prepared = compiler.compile(&sink, &payload).await.unwrap();
    assert_eq!(
        prepared.body.as_deref(),
        Some(serde_json::to_string(&payload).unwrap().as_str())
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn compile_rejects_unknown_secret(harness: &mut TestHarness) {
    let sink = sink_with(
        "https://api.example.com/alert",
        None,
        None,
        None,
        vec!["NOT_A_SECRET"],
    );
    let compiler = SinkCompiler::new(harness.db_pool.clone(), Arc::new(TestHttpSender::new()));
    assert!(compiler.compile(&sink, &serde_json::json!({})).await.is_err());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_fire_executes_and_redacts_secrets(harness: &mut TestHarness) {
    let secret_value = "s3cr3t-value-8c1f";
    seed_secret(&harness.db_pool, "T", secret_value).await;
    let sink = sink_with(
        "https://api.example.com/alert",
        Some("token=__T__"),
        Some("Authorization: Bearer __T__\nX-Env: __T__"),
        None,
        vec!["T"],
    );

    let sender = Arc::new(TestHttpSender::new());
    let compiler = SinkCompiler::new(harness.db_pool.clone(), sender.clone());

    let result = compiler
        .test_fire(&sink, &serde_json::json!({"foo": "bar"}))
        .await
        .expect("test fire");

    assert_eq!(result.status, 200);
    assert!(result.ok);

    // The real request carried the resolved secret.
    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].url.contains(secret_value));

    // The summary carries no secret material anywhere.
    let rendered = serde_json::to_string(&result.request).unwrap();
    assert!(!rendered.contains(secret_value));
    assert!(result.request.url.contains("__T__"));
    let auth = result
        .request
        .headers
        .iter()
        .find(|(name, _)| name == "Authorization")
        .map(|(_, value)| value.clone())
        .unwrap();
    assert_eq!(auth, "Bearer ***");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_fire_caps_response_body(harness: &mut TestHarness) {
    let sink = sink_with("https://api.example.com/alert", None, None, None, vec![]);
    let sender = Arc::new(TestHttpSender::new());
    sender.respond_with(HttpResponse {
        status: 200,
        headers: vec![],
        body: vec![b'x'; 10_000],
    });

    let compiler = SinkCompiler::new(harness.db_pool.clone(), sender);
    let result = compiler
        .test_fire(&sink, &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(result.response_body.len(), 4096);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_fire_reports_unexpected_status(harness: &mut TestHarness) {
    let mut sink = sink_with("https://api.example.com/alert", None, None, None, vec![]);
    sink.ok_status = Some(201);

    let sender = Arc::new(TestHttpSender::new());
    let compiler = SinkCompiler::new(harness.db_pool.clone(), sender);
    let result = compiler
        .test_fire(&sink, &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(result.status, 200);
    assert!(!result.ok, "200 is not the configured ok_status");
}
