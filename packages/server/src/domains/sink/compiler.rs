//! Compiles an alert sink plus a JSON payload into a prepared HTTP request.
//!
//! Compilation is deterministic: resolve named secrets into `__NAME__`
//! placeholders, substitute them literally (no URL-encoding; templates are
//! written for their context), assemble the URL and headers, evaluate the
//! body transform, and fill in defaults. Test fires execute the prepared
//! request synchronously and return a summary with every secret value
//! substituted back to its placeholder.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use super::models::HttpAlertSink;
use crate::domains::secret::Secret;
use crate::kernel::traits::{BaseHttpSender, HttpRequest};

/// Response body bytes kept in a test-fire result.
const TEST_FIRE_BODY_CAP: usize = 4096;

/// Header names (substring, case-insensitive) whose values are masked in
/// request summaries even after placeholder substitution.
const SENSITIVE_HEADER_MARKERS: [&str; 6] =
    ["authorization", "cookie", "api-key", "apikey", "token", "secret"];

/// A fully-resolved outbound request.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub ok_status: u16,
    /// Placeholder → resolved value, for downstream redaction.
    pub secrets: HashMap<String, String>,
}

/// Redacted request summary safe to persist and display.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Outcome of a synchronous test fire.
#[derive(Debug, Clone, Serialize)]
pub struct TestFireResult {
    pub status: u16,
    pub ok: bool,
    pub response_headers: Vec<(String, String)>,
    /// Size-capped, lossily decoded response body.
    pub response_body: String,
    pub request: RequestSummary,
}

pub struct SinkCompiler {
    pool: PgPool,
    http_sender: Arc<dyn BaseHttpSender>,
}

impl SinkCompiler {
    pub fn new(pool: PgPool, http_sender: Arc<dyn BaseHttpSender>) -> Self {
        Self { pool, http_sender }
    }

    /// Compile a sink against a payload.
    pub async fn compile(
        &self,
        sink: &HttpAlertSink,
        payload: &serde_json::Value,
    ) -> Result<PreparedRequest> {
        // 1. Resolve named secrets and build the substitution map.
        let secrets = self.resolve_secrets(sink).await?;
        let substitute = |input: &str| -> String {
            let mut out = input.to_string();
            for (placeholder, value) in &secrets {
                out = out.replace(placeholder, value);
            }
            out
        };

        // 2. Method.
        let method = sink.method.trim().to_uppercase();
        if method.is_empty() {
            bail!("sink {} has no HTTP method", sink.id);
        }

        // 3. URL with query params.
        let url = build_url(
            &substitute(&sink.uri),
            sink.query_params.as_deref().map(&substitute).as_deref(),
        )?;

        // 4. Headers.
        let mut headers = match sink.headers.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_headers(&substitute(raw))?,
            _ => Vec::new(),
        };

        // 5. Body transform.
        let body = match sink.body.as_deref().map(&substitute) {
            Some(expr) if !expr.trim().is_empty() => Some(eval_body_transform(&expr, payload)?),
            _ => Some(serde_json::to_string(payload).context("encode payload")?),
        };

        // 6. Content type default.
        let has_body = body.as_deref().is_some_and(|b| !b.is_empty());
        let has_content_type = headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        if has_body && !has_content_type {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        // 7. Success status default.
        let ok_status = sink.ok_status.map(|s| s as u16).unwrap_or(200);

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
            ok_status,
            secrets,
        })
    }

    /// Compile and synchronously execute against the injected HTTP client.
    pub async fn test_fire(
        &self,
        sink: &HttpAlertSink,
        payload: &serde_json::Value,
    ) -> Result<TestFireResult> {
        let prepared = self.compile(sink, payload).await?;

        let response = self
            .http_sender
            .send(&HttpRequest {
                method: prepared.method.clone(),
                url: prepared.url.clone(),
                headers: prepared.headers.clone(),
                body: prepared.body.clone(),
            })
            .await
            .context("test fire sink")?;

        let capped = &response.body[..response.body.len().min(TEST_FIRE_BODY_CAP)];

        Ok(TestFireResult {
            status: response.status,
            ok: response.status == prepared.ok_status,
            response_headers: response.headers,
            response_body: String::from_utf8_lossy(capped).to_string(),
            request: redact_request(&prepared),
        })
    }

    /// Fetch each named secret by name; a missing name is an error.
    async fn resolve_secrets(&self, sink: &HttpAlertSink) -> Result<HashMap<String, String>> {
        if sink.secrets.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = Secret::find_by_names(&sink.secrets, &self.pool)
            .await
            .context("resolve sink secrets")?;
        let mut by_name: HashMap<String, Secret> =
            rows.into_iter().map(|s| (s.name.clone(), s)).collect();

        let mut resolved = HashMap::new();
        for name in &sink.secrets {
            let secret = by_name
                .remove(name)
                .ok_or_else(|| anyhow!("sink references unknown secret {name}"))?;
            resolved.insert(secret.placeholder(), secret.value);
        }
        Ok(resolved)
    }
}

/// Assemble the final URL: trim stray trailing separators, append query
/// params with `?` or `&` as appropriate, and validate by parsing.
fn build_url(uri: &str, query_params: Option<&str>) -> Result<String> {
    let mut url = uri.trim().trim_end_matches(['?', '&']).to_string();

    if let Some(params) = query_params {
        let params = params.trim().trim_start_matches(['?', '&']);
        if !params.is_empty() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(params);
        }
    }

    url::Url::parse(&url).with_context(|| format!("invalid sink URL: {url}"))?;
    Ok(url)
}

/// Parse the sink's header value.
///
/// A value starting with `{` is a JSON object: strings pass through, arrays
/// join with `, `, everything else is stringified. Anything else is parsed
/// as newline-delimited `Key: Value` lines; duplicate keys join with `, `.
fn parse_headers(raw: &str) -> Result<Vec<(String, String)>> {
    let trimmed = raw.trim();
    let mut headers: Vec<(String, String)> = Vec::new();

    let mut push = |name: String, value: String| {
        match headers.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing_value)) => {
                existing_value.push_str(", ");
                existing_value.push_str(&value);
            }
            None => headers.push((name, value)),
        }
    };

    if trimmed.starts_with('{') {
        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(trimmed).context("parse headers as JSON object")?;
        for (name, value) in object {
            let rendered = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
                other => other.to_string(),
            };
            push(name, rendered);
        }
    } else {
        for line in trimmed.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed header line: {line}"))?;
            push(name.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(headers)
}

/// Evaluate the body transform expression against the payload.
///
/// The expression language is a path/projection over JSON; a single match
/// marshals to that value, multiple matches marshal to an array.
fn eval_body_transform(expr: &str, payload: &serde_json::Value) -> Result<String> {
    let matches = jsonpath_lib::select(payload, expr.trim())
        .map_err(|e| anyhow!("invalid body transform {expr:?}: {e}"))?;

    let value = match matches.as_slice() {
        [] => serde_json::Value::Null,
        [single] => (*single).clone(),
        many => serde_json::Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    };
    serde_json::to_string(&value).context("encode transformed body")
}

/// Build a request summary with secrets substituted back to placeholders and
/// sensitive headers masked.
fn redact_request(prepared: &PreparedRequest) -> RequestSummary {
    let redact = |input: &str| -> String {
        let mut out = input.to_string();
        for (placeholder, value) in &prepared.secrets {
            if !value.is_empty() {
                out = out.replace(value, placeholder);
            }
        }
        out
    };

    let headers = prepared
        .headers
        .iter()
        .map(|(name, value)| {
            let value = if is_sensitive_header(name) {
                mask_header_value(value)
            } else {
                redact(value)
            };
            (name.clone(), value)
        })
        .collect();

    RequestSummary {
        method: prepared.method.clone(),
        url: redact(&prepared.url),
        headers,
        body: prepared.body.as_deref().map(redact),
    }
}

fn is_sensitive_header(name: &str) -> bool {
    let lowered = name.to_lowercase();
    SENSITIVE_HEADER_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Mask to `<Prefix> ***`, keeping a scheme like `Bearer` when present.
fn mask_header_value(value: &str) -> String {
    match value.split_whitespace().next() {
        Some(prefix) if prefix != value => format!("{prefix} ***"),
        _ => "***".to_string(),
    }
}
