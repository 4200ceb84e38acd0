use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dl_error::DevloopError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

#[derive(Debug)]
pub struct ApiErrorResponse {
    pub status: StatusCode,
    pub error: ApiError,
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&self.error).unwrap_or_default();
        (self.status, [("content-type", "application/json")], body).into_response()
    }
}

impl From<(StatusCode, ApiError)> for ApiErrorResponse {
    fn from((status, error): (StatusCode, ApiError)) -> Self {
        Self { status, error }
    }
}

impl From<DevloopError> for ApiErrorResponse {
    fn from(err: DevloopError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = err.code(), "request failed: {}", err);
        }
        let body = err.body();
        Self {
            status,
            error: ApiError::new(body.code, body.message),
        }
    }
}

impl From<JsonRejection> for ApiErrorResponse {
    fn from(rejection: JsonRejection) -> Self {
        DevloopError::invalid_input(format!("Invalid request body: {}", rejection.body_text()))
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_json_serialization() {
        let err = ApiError::new("TEST", "test message");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "TEST");
        assert_eq!(json["message"], "test message");
    }

    #[test]
    fn api_error_response_into_response() {
        let resp = ApiErrorResponse {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new("BAD", "bad request"),
        };
        let response = resp.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn devloop_errors_keep_their_codes() {
        let resp = ApiErrorResponse::from(DevloopError::AgentNotFound("a1".into()));
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(resp.error.code, "AGENT_NOT_FOUND");
        assert!(resp.error.message.contains("a1"));

        let resp = ApiErrorResponse::from(DevloopError::invalid_input("label is required"));
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(resp.error.code, "INVALID_INPUT");

        let resp = ApiErrorResponse::from(DevloopError::RuntimeTimeout { timeout_secs: 10 });
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.error.code, "OPENCODE_SERVER_TIMEOUT");
    }

    #[test]
    fn internal_code() {
        assert_eq!(ApiError::internal("boom").code, "INTERNAL_ERROR");
    }
}
