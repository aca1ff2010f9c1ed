use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use tackroom_infra::context_store::ContextStoreError;
use tackroom_infra::security::SecurityError;

pub fn security_error_to_response(err: SecurityError) -> axum::response::Response {
    match err {
        SecurityError::PrivilegeViolation(e) => json_error(StatusCode::FORBIDDEN, "privilege_violation", e.to_string()),
        SecurityError::ScopeMismatch(msg) => json_error(StatusCode::BAD_REQUEST, "scope_mismatch", msg),
        SecurityError::Store(ContextStoreError::Acquire(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "database_unavailable", msg)
        }
        SecurityError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "context_store_error", e.to_string()),
        SecurityError::ConnectionDiscipline(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "connection_discipline", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
