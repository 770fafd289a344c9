//! Contract with the durable preference store (server-of-record).
//!
//! The engine only depends on the request/response shapes below; the
//! concrete HTTP client lives in [`http`] and test doubles implement
//! [`PreferenceBackend`] directly.

mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors reported by the durable store
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A full-document persistence request
#[derive(Debug, Clone, Serialize)]
pub struct SaveRequest {
    /// Logical user the document belongs to (mock routing; the HTTP backend
    /// scopes the user through its auth token instead)
    #[serde(skip)]
    pub user_id: String,
    /// Full preference tree
    pub preferences: Map<String, Value>,
    /// Expected current version for optimistic locking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Originating session, echoed in the server's broadcast
    pub session_id: String,
}

/// Outcome of a persistence call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Document persisted; the server-confirmed version
    Saved { version: u64 },
    /// The server's version had advanced past the expected one
    Conflict,
}

/// Authoritative document state returned by a fetch
#[derive(Debug, Clone, Deserialize)]
pub struct FetchResponse {
    pub preferences: Map<String, Value>,
    pub version: u64,
}

/// Durable preference store as seen by the engine
#[async_trait]
pub trait PreferenceBackend: Send + Sync {
    /// Fetch the authoritative document and version
    async fn fetch(&self, user_id: &str) -> BackendResult<FetchResponse>;

    /// Persist the full document with optimistic locking
    async fn save(&self, request: SaveRequest) -> BackendResult<SaveOutcome>;

    /// Delete one dotted key path; returns the fresh version
    async fn remove_key(&self, user_id: &str, key: &str) -> BackendResult<u64>;

    /// Delete several dotted key paths at once; returns the fresh version
    async fn remove_keys(&self, user_id: &str, keys: &[String]) -> BackendResult<u64>;
}
