//! The `{error: {message, type, code}}` body shape (spec §6/§7), attached
//! to `axum` responses only at the façade boundary — every other component
//! returns plain `bool`/`Option`/domain result values, not HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A model name that isn't in the config — a 400 admission error on the
    /// `/v1/*` request path (matches `main.py`'s `chat_completions`).
    #[error("model not found: {0}")]
    UnconfiguredModel(String),
    /// Unknown model name on an admin lookup, e.g. `/admin/models/{name}/status`.
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("failed to start model: {0}")]
    StartFailed(String),
    #[error("failed to reload model: {0}")]
    ReloadFailed(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("gateway timeout: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            GatewayError::UnconfiguredModel(_) => (StatusCode::BAD_REQUEST, "model_not_found"),
            GatewayError::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
            GatewayError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            GatewayError::StartFailed(_) => (StatusCode::BAD_REQUEST, "start_failed"),
            GatewayError::ReloadFailed(_) => (StatusCode::BAD_REQUEST, "reload_failed"),
            GatewayError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "bad_gateway"),
            GatewayError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    code: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                error_type: error_type.to_string(),
                code: status.as_u16(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}
