//! Domain and hash extraction from raw browser events.

use thiserror::Error;

use crate::domains::event::Event;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("event carries no URL")]
    MissingUrl,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("event carries no file hash")]
    MissingHash,
}

/// Normalize a raw URL to its bare domain.
///
/// Handles schemeless inputs, strips ports, lower-cases, and unwraps IPv6
/// bracket literals.
pub fn normalize_domain(raw: &str) -> Result<String, ExtractError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::InvalidUrl(raw.to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let parsed =
        url::Url::parse(&candidate).map_err(|_| ExtractError::InvalidUrl(raw.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ExtractError::InvalidUrl(raw.to_string()))?;

    Ok(host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase())
}

/// Pulls the request/response URL out of network events.
pub struct NetworkEventExtractor;

impl NetworkEventExtractor {
    /// Normalized domain for a network event.
    pub fn domain(event: &Event) -> Result<String, ExtractError> {
        let url = event
            .data
            .pointer("/request/url")
            .or_else(|| event.data.pointer("/response/url"))
            .or_else(|| event.data.get("url"))
            .and_then(|v| v.as_str())
            .ok_or(ExtractError::MissingUrl)?;

        normalize_domain(url)
    }
}

/// Pulls content hashes out of file/download events.
pub struct FileEventExtractor;

impl FileEventExtractor {
    pub fn hash(event: &Event) -> Result<String, ExtractError> {
        let hash = event
            .data
            .get("sha256")
            .or_else(|| event.data.get("hash"))
            .and_then(|v| v.as_str())
            .ok_or(ExtractError::MissingHash)?;

        Ok(hash.trim().to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::JobId;

    fn network_event(url: &str) -> Event {
        Event::new(
            JobId::new(),
            "Network.requestWillBeSent",
            serde_json::json!({ "request": { "url": url } }),
        )
    }

    #[test]
    fn normalizes_standard_urls() {
        assert_eq!(
            normalize_domain("https://Example.COM/path?q=1").unwrap(),
            "example.com"
        );
    }

    #[test]
    fn strips_ports() {
        assert_eq!(
            normalize_domain("https://example.com:8443/x").unwrap(),
            "example.com"
        );
    }

    #[test]
    fn handles_schemeless_input() {
        assert_eq!(normalize_domain("cdn.example.net/asset.js").unwrap(), "cdn.example.net");
    }

    #[test]
    fn unwraps_ipv6_literals() {
        assert_eq!(normalize_domain("http://[2001:db8::1]:8080/").unwrap(), "2001:db8::1");
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("http://").is_err());
    }

    #[test]
    fn network_extractor_reads_request_url() {
        let event = network_event("https://tracker.example.org/pixel");
        assert_eq!(
            NetworkEventExtractor::domain(&event).unwrap(),
            "tracker.example.org"
        );
    }

    #[test]
    fn network_extractor_falls_back_to_response_url() {
        let event = Event::new(
            JobId::new(),
            "Network.responseReceived",
            serde_json::json!({ "response": { "url": "https://api.example.io/v1" } }),
        );
        assert_eq!(NetworkEventExtractor::domain(&event).unwrap(), "api.example.io");
    }

    #[test]
    fn network_extractor_errors_without_url() {
        let event = Event::new(JobId::new(), "Network.requestWillBeSent", serde_json::json!({}));
        assert_eq!(
            NetworkEventExtractor::domain(&event).unwrap_err(),
            ExtractError::MissingUrl
        );
    }

    #[test]
    fn file_extractor_lowercases_hash() {
        let event = Event::new(
            JobId::new(),
            "Page.downloadWillBegin",
            serde_json::json!({ "sha256": "ABCDEF0123" }),
        );
        assert_eq!(FileEventExtractor::hash(&event).unwrap(), "abcdef0123");
    }
}
