use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use baton_core::BatonError;
use tracing::warn;

/// A [`BatonError`] rendered as an HTTP response:
/// `{"error": {"kind": "...", "message": "..."}}`.
#[derive(Debug)]
pub struct ApiError(pub BatonError);

impl From<BatonError> for ApiError {
    fn from(e: BatonError) -> Self {
        Self(e)
    }
}

/// HTTP status for an error kind.
pub fn status_for(error: &BatonError) -> StatusCode {
    match error {
        BatonError::TaskNotFound(_)
        | BatonError::SessionNotFound(_)
        | BatonError::AuditNotFound(_)
        | BatonError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
        BatonError::InvalidTransition { .. }
        | BatonError::SessionConflict(_)
        | BatonError::Cancelled(_) => StatusCode::CONFLICT,
        BatonError::Protocol(_) | BatonError::Json(_) => StatusCode::BAD_REQUEST,
        BatonError::Expired(_) => StatusCode::GONE,
        BatonError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
        BatonError::NoAgentAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BatonError::GatewayUnavailable(_) | BatonError::Http(_) => StatusCode::BAD_GATEWAY,
        BatonError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BatonError::SandboxFault(_)
        | BatonError::Integrity(_)
        | BatonError::Config(_)
        | BatonError::Agent(_)
        | BatonError::Planning(_)
        | BatonError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(kind = self.0.kind(), error = %self.0, "Api: request failed");
        }
        let body = serde_json::json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use baton_core::TaskState;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(status_for(&BatonError::TaskNotFound(id)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&BatonError::InvalidTransition {
                task_id: id,
                from: TaskState::Pending,
                to: TaskState::Cancelled,
                current: TaskState::Completed,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BatonError::Throttled {
                endpoint: "reviewer".into()
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&BatonError::Protocol("bad".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
