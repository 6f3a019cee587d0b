use apix_core::CoreError;
use apix_protocol::http::HttpErrorEnvelope;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use uuid::Uuid;

pub type HttpResult<T> = Result<T, Response>;

/// Maps a `CoreError` to the frozen REST error envelope (§7). Every
/// handler that calls into the core funnels its `Err` branch through
/// this, so the wire contract stays in one place instead of being
/// re-derived per endpoint.
pub fn core_error_response(err: CoreError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = HttpErrorEnvelope {
        error: err.code().to_owned(),
        message: err.to_string(),
        status_code: status.as_u16(),
        timestamp: chrono::Utc::now(),
        request_id: Uuid::new_v4().to_string(),
        details: None,
    };
    (status, Json(envelope)).into_response()
}

pub fn bad_request(message: impl Into<String>) -> Response {
    let envelope = HttpErrorEnvelope {
        error: apix_protocol::error_codes::INVALID_ARGUMENT.to_owned(),
        message: message.into(),
        status_code: 400,
        timestamp: chrono::Utc::now(),
        request_id: Uuid::new_v4().to_string(),
        details: None,
    };
    (StatusCode::BAD_REQUEST, Json(envelope)).into_response()
}

pub fn forbidden(action: &str, resource_type: &str) -> Response {
    let envelope = HttpErrorEnvelope {
        error: apix_protocol::error_codes::PERMISSION_DENIED.to_owned(),
        message: format!("permission denied: {action} on {resource_type}"),
        status_code: 403,
        timestamp: chrono::Utc::now(),
        request_id: Uuid::new_v4().to_string(),
        details: None,
    };
    (StatusCode::FORBIDDEN, Json(envelope)).into_response()
}

pub fn unauthorized(message: impl Into<String>) -> Response {
    let envelope = HttpErrorEnvelope {
        error: apix_protocol::error_codes::AUTH_REQUIRED.to_owned(),
        message: message.into(),
        status_code: 401,
        timestamp: chrono::Utc::now(),
        request_id: Uuid::new_v4().to_string(),
        details: None,
    };
    (StatusCode::UNAUTHORIZED, Json(envelope)).into_response()
}
