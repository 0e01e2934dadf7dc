use crate::schema::{ExternalStatus, ExternalTaskRequest, ExternalTaskResult};
use async_trait::async_trait;
use baton_core::{BatonError, BatonResult};
use baton_governor::status_error;
use std::time::Duration;
use tracing::debug;

/// Client side of the external agent task protocol.
#[async_trait]
pub trait ExternalAgentClient: Send + Sync {
    /// Creates a task on the remote agent and returns its first status.
    async fn create_task(&self, request: &ExternalTaskRequest) -> BatonResult<ExternalStatus>;

    /// Current status of a remote task.
    async fn get_status(&self, id: &str) -> BatonResult<ExternalStatus>;

    /// Final result of a remote task.
    async fn get_result(&self, id: &str) -> BatonResult<ExternalTaskResult>;

    /// Asks the remote agent to cancel a task.
    async fn cancel_task(&self, id: &str) -> BatonResult<()>;
}

/// HTTP binding of the external protocol.
///
/// | operation | request |
/// |---|---|
/// | create | `POST {base}/tasks` |
/// | status | `GET {base}/tasks/{id}` |
/// | result | `GET {base}/tasks/{id}/result` |
/// | cancel | `POST {base}/tasks/{id}/cancel` |
pub struct HttpExternalClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpExternalClient {
    /// Creates a client with a per-request timeout.
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

    async fn decode<T: serde::de::DeserializeOwned>(
        context: &str,
        resp: reqwest::Response,
    ) -> BatonResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(context, status, &body));
        }
        resp.json()
            .await
            .map_err(|e| BatonError::Protocol(format!("{context}: invalid response: {e}")))
    }
}

fn send_error(e: reqwest::Error) -> BatonError {
    if e.is_timeout() {
        BatonError::Timeout(e.to_string())
    } else {
        BatonError::GatewayUnavailable(e.to_string())
    }
}

#[async_trait]
impl ExternalAgentClient for HttpExternalClient {
    async fn create_task(&self, request: &ExternalTaskRequest) -> BatonResult<ExternalStatus> {
        let url = format!("{}/tasks", self.base_url);
        debug!(url = %url, external_id = %request.id, "HttpExternalClient: create task");
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(send_error)?;
        Self::decode("create task", resp).await
    }

    async fn get_status(&self, id: &str) -> BatonResult<ExternalStatus> {
        let url = format!("{}/tasks/{id}", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(send_error)?;
        Self::decode("get status", resp).await
    }

    async fn get_result(&self, id: &str) -> BatonResult<ExternalTaskResult> {
        let url = format!("{}/tasks/{id}/result", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(send_error)?;
        Self::decode("get result", resp).await
    }

    async fn cancel_task(&self, id: &str) -> BatonResult<()> {
        let url = format!("{}/tasks/{id}/cancel", self.base_url);
        let resp = self.http.post(&url).send().await.map_err(send_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error("cancel task", status, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::ExternalState;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_create_and_poll() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .and(body_partial_json(serde_json::json!({"id": "t-1", "type": "review"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "t-1", "state": "submitted"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "t-1", "state": "working", "progress": 0.4
            })))
            .mount(&server)
            .await;

        let client = HttpExternalClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let req = ExternalTaskRequest {
            id: "t-1".into(),
            task_type: "review".into(),
            parameters: serde_json::json!({}),
            priority: Default::default(),
            timeout: 60,
        };
        assert_eq!(
            client.create_task(&req).await.unwrap().state,
            ExternalState::Submitted
        );
        let status = client.get_status("t-1").await.unwrap();
        assert_eq!(status.state, ExternalState::Working);
        assert_eq!(status.progress, Some(0.4));
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let client =
            HttpExternalClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = client.get_status("x").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_cancel_not_found_is_structural() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks/gone/cancel"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = HttpExternalClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.cancel_task("gone").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
