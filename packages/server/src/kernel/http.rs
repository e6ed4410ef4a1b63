//! HTTP sender implementations for sink test fires.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::RwLock;

use super::traits::{BaseHttpSender, HttpRequest, HttpResponse};

/// Real outbound sender backed by `reqwest`.
pub struct ReqwestHttpSender {
    client: reqwest::Client,
}

impl ReqwestHttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpSender {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl BaseHttpSender for ReqwestHttpSender {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_str(&request.method)
            .with_context(|| format!("invalid HTTP method: {}", request.method))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("send request to {}", request.url))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.bytes().await.context("read response body")?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Mock sender that records requests and replays a canned response.
///
/// Tests inspect `sent()` to assert on the exact request the compiler built.
pub struct TestHttpSender {
    sent: RwLock<Vec<HttpRequest>>,
    response: RwLock<HttpResponse>,
}

impl TestHttpSender {
    pub fn new() -> Self {
        Self {
            sent: RwLock::new(Vec::new()),
            response: RwLock::new(HttpResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: b"{}".to_vec(),
            }),
        }
    }

    /// Replace the canned response returned to subsequent sends.
    pub fn respond_with(&self, response: HttpResponse) {
        *self.response.write().unwrap_or_else(|e| e.into_inner()) = response;
    }

    /// Requests captured so far.
    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for TestHttpSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseHttpSender for TestHttpSender {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.sent
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        Ok(self.response.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sender_records_requests() {
        let sender = TestHttpSender::new();
        let request = HttpRequest {
            method: "POST".to_string(),
            url: "https://example.com".to_string(),
            headers: vec![],
            body: Some("{}".to_string()),
        };

        let response = sender.send(&request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(sender.sent()[0].url, "https://example.com");
    }

    #[tokio::test]
    async fn test_sender_replays_configured_response() {
        let sender = TestHttpSender::new();
        sender.respond_with(HttpResponse {
            status: 503,
            headers: vec![],
            body: b"overloaded".to_vec(),
        });

        let request = HttpRequest {
            method: "GET".to_string(),
            url: "https://example.com".to_string(),
            headers: vec![],
            body: None,
        };
        let response = sender.send(&request).await.unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.body, b"overloaded");
    }
}
