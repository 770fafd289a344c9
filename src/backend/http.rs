//! HTTP implementation of the durable preference store contract.
//!
//! Talks to the preferences REST API: GET/PUT `/preferences`,
//! DELETE `/preferences/<dotted.key>`, POST `/preferences/batch-delete`.
//! A PUT against a stale version comes back as 409 with `conflict: true`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{BackendError, BackendResult, FetchResponse, PreferenceBackend, SaveOutcome, SaveRequest};

/// Response envelope used by every preferences endpoint
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    success: bool,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    preferences: Option<Map<String, Value>>,
    #[serde(default)]
    conflict: bool,
    #[serde(default)]
    error: Option<String>,
}

impl ApiEnvelope {
    fn version(self) -> BackendResult<u64> {
        if !self.success {
            return Err(BackendError::Rejected(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        self.version
            .ok_or_else(|| BackendError::InvalidResponse("missing version".to_string()))
    }
}

/// Reqwest-backed preference store client.
///
/// The bearer token scopes every request to one logical user, so the
/// `user_id` trait parameter is not sent on the wire.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl PreferenceBackend for HttpBackend {
    async fn fetch(&self, _user_id: &str) -> BackendResult<FetchResponse> {
        let envelope: ApiEnvelope = self
            .request(reqwest::Method::GET, "preferences")
            .send()
            .await?
            .json()
            .await?;

        if !envelope.success {
            return Err(BackendError::Rejected(
                envelope.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let version = envelope
            .version
            .ok_or_else(|| BackendError::InvalidResponse("missing version".to_string()))?;
        let preferences = envelope.preferences.unwrap_or_default();

        debug!(version, "fetched authoritative preferences");
        Ok(FetchResponse {
            preferences,
            version,
        })
    }

    async fn save(&self, request: SaveRequest) -> BackendResult<SaveOutcome> {
        let response = self
            .request(reqwest::Method::PUT, "preferences")
            .json(&request)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(SaveOutcome::Conflict);
        }

        let envelope: ApiEnvelope = response.json().await?;
        if envelope.conflict {
            return Ok(SaveOutcome::Conflict);
        }

        let version = envelope.version()?;
        debug!(version, "preferences persisted");
        Ok(SaveOutcome::Saved { version })
    }

    async fn remove_key(&self, _user_id: &str, key: &str) -> BackendResult<u64> {
        let envelope: ApiEnvelope = self
            .request(reqwest::Method::DELETE, &format!("preferences/{}", key))
            .send()
            .await?
            .json()
            .await?;

        envelope.version()
    }

    async fn remove_keys(&self, _user_id: &str, keys: &[String]) -> BackendResult<u64> {
        let envelope: ApiEnvelope = self
            .request(reqwest::Method::POST, "preferences/batch-delete")
            .json(&json!({ "keys": keys }))
            .send()
            .await?
            .json()
            .await?;

        envelope.version()
    }
}
