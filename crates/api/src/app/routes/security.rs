use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use tackroom_auth::{Principal, Role};
use tackroom_core::TenantId;
use tackroom_infra::security::SecurityContextManager;

use crate::app::errors;
use crate::app::routes::common::{require_connection, require_principal, require_role};
use crate::context::RequestConnection;

/// Context currently applied to this request's connection, as the database sees it.
pub async fn context(
    Extension(manager): Extension<Arc<SecurityContextManager>>,
    principal: Option<Extension<Principal>>,
    connection: Option<Extension<RequestConnection>>,
) -> axum::response::Response {
    if let Err(resp) = require_principal(principal) {
        return resp;
    }
    let connection = match require_connection(connection) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let mut session = connection.lock().await;
    match manager.read_context(session.as_mut()).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => errors::security_error_to_response(e),
    }
}

pub async fn validate_context(
    Extension(manager): Extension<Arc<SecurityContextManager>>,
    principal: Option<Extension<Principal>>,
    connection: Option<Extension<RequestConnection>>,
) -> axum::response::Response {
    if let Err(resp) = require_principal(principal) {
        return resp;
    }
    let connection = match require_connection(connection) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let mut session = connection.lock().await;
    Json(manager.validate_security_context(session.as_mut()).await).into_response()
}

pub async fn policies(
    Extension(manager): Extension<Arc<SecurityContextManager>>,
    principal: Option<Extension<Principal>>,
    connection: Option<Extension<RequestConnection>>,
) -> axum::response::Response {
    let principal = match require_principal(principal) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(&principal, Role::Admin, "read RLS policy status") {
        return resp;
    }
    let connection = match require_connection(connection) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let mut session = connection.lock().await;
    let status = manager.check_policy_status(session.as_mut()).await;
    let integrity = manager.validate_rls_policy_integrity(session.as_mut()).await;

    Json(serde_json::json!({
        "status": status,
        "integrity": integrity,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ComplianceQuery {
    pub tenant_id: Option<String>,
}

/// Full compliance report for `tenant_id`, defaulting to the caller's tenant.
pub async fn compliance(
    Extension(manager): Extension<Arc<SecurityContextManager>>,
    principal: Option<Extension<Principal>>,
    connection: Option<Extension<RequestConnection>>,
    Query(query): Query<ComplianceQuery>,
) -> axum::response::Response {
    let principal = match require_principal(principal) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(&principal, Role::Admin, "generate a compliance report") {
        return resp;
    }

    let tenant_id = match (query.tenant_id, principal.tenant_id.clone()) {
        (Some(raw), _) => match TenantId::new(raw) {
            Ok(t) => t,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_tenant_id", e.to_string()),
        },
        (None, Some(t)) => t,
        (None, None) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "missing_tenant_id", "tenant_id is required");
        }
    };

    let connection = match require_connection(connection) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let mut session = connection.lock().await;
    Json(manager.generate_compliance_report(&tenant_id, session.as_mut()).await).into_response()
}

/// Switch this request's connection into supervisor bypass mode.
pub async fn bypass(
    Extension(manager): Extension<Arc<SecurityContextManager>>,
    principal: Option<Extension<Principal>>,
    connection: Option<Extension<RequestConnection>>,
) -> axum::response::Response {
    let principal = match require_principal(principal) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let connection = match require_connection(connection) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let mut session = connection.lock().await;
    if let Err(e) = manager.set_admin_bypass_context(&principal, session.as_mut()).await {
        return errors::security_error_to_response(e);
    }

    match manager.read_context(session.as_mut()).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => errors::security_error_to_response(e),
    }
}
