use async_trait::async_trait;
use baton_core::{BatonError, BatonResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// A call to an external tool endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Governed endpoint name.
    pub endpoint: String,
    /// Operation on that endpoint.
    pub operation: String,
    /// Request body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ToolRequest {
    /// Creates a request.
    pub fn new(
        endpoint: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            operation: operation.into(),
            payload,
        }
    }
}

/// Client side of a tool endpoint. The governor wraps every call with
/// admission control and health accounting.
#[async_trait]
pub trait ToolEndpoint: Send + Sync {
    /// Performs the call.
    async fn invoke(&self, request: &ToolRequest) -> BatonResult<serde_json::Value>;
}

/// Tool endpoint reached over HTTP: `POST {base_url}/{operation}` with the
/// payload as JSON body.
pub struct HttpToolEndpoint {
    base_url: String,
    http: reqwest::Client,
}

impl HttpToolEndpoint {
    /// Creates a client for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> BatonResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BatonError::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

/// Maps a non-success HTTP status to the error taxonomy: rate limiting and
/// server errors are transient, other client errors are not.
pub fn status_error(context: &str, status: reqwest::StatusCode, body: &str) -> BatonError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        BatonError::Http(format!("{context}: {status}: {body}"))
    } else {
        BatonError::Protocol(format!("{context}: {status}: {body}"))
    }
}

#[async_trait]
impl ToolEndpoint for HttpToolEndpoint {
    async fn invoke(&self, request: &ToolRequest) -> BatonResult<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, request.operation);
        debug!(endpoint = %request.endpoint, url = %url, "HttpToolEndpoint: calling");

        let resp = self
            .http
            .post(&url)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| BatonError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(&request.endpoint, status, &body));
        }
        resp.json()
            .await
            .map_err(|e| BatonError::Protocol(format!("{}: invalid JSON: {e}", request.endpoint)))
    }
}
