// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Business logic (like "evaluate rules") belongs in domain functions that use
// these traits.
//
// Naming convention: Base* for trait names (e.g., BaseSharedCache)

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

// =============================================================================
// Shared Cache Trait (Infrastructure - Redis-compatible KV)
// =============================================================================

/// Shared key-value cache visible to every replica.
///
/// Backed by a Redis-compatible store in production and by
/// `InMemorySharedCache` in tests and single-node deployments. Callers treat
/// every operation as best-effort unless they need the atomicity of
/// `set_nx` (alert-once dedupe depends on it).
#[async_trait]
pub trait BaseSharedCache: Send + Sync {
    /// Get a value by key. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, optionally bounded by a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically set the key iff it is absent.
    ///
    /// Returns `true` when this call created the key, `false` when the key
    /// already existed. This is the primitive behind alert-once dedupe.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Whether the key currently exists (read-only, no mutation).
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

// =============================================================================
// HTTP Sender Trait (Infrastructure - sink test fires)
// =============================================================================

/// An outbound HTTP request, fully resolved.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Response summary captured from an outbound request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Executes outbound HTTP requests.
///
/// The sink compiler's test-fire path goes through this trait so tests can
/// capture the request instead of touching the network.
#[async_trait]
pub trait BaseHttpSender: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}
