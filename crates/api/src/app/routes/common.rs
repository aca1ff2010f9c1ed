use axum::{Extension, http::StatusCode, response::Response};

use tackroom_auth::{Principal, Role, require_role_at_least};

use crate::app::errors::json_error;
use crate::context::RequestConnection;

/// Principal attached by authentication, or `401`.
pub fn require_principal(principal: Option<Extension<Principal>>) -> Result<Principal, Response> {
    principal
        .map(|Extension(p)| p)
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "bearer token required"))
}

/// Connection pinned by the gate, or `503` when the request proceeded
/// without a security context.
pub fn require_connection(connection: Option<Extension<RequestConnection>>) -> Result<RequestConnection, Response> {
    connection.map(|Extension(c)| c).ok_or_else(|| {
        json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "security_context_unavailable",
            "no security context is active for this request",
        )
    })
}

pub fn require_role(principal: &Principal, role: Role, attempted: &'static str) -> Result<(), Response> {
    require_role_at_least(principal, role, attempted)
        .map_err(|e| json_error(StatusCode::FORBIDDEN, "privilege_violation", e.to_string()))
}
