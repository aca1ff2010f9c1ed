//! HTTP API application wiring (Axum router + shared state).
//!
//! - `routes/`: HTTP routes + handlers
//! - `errors.rs`: consistent error responses
//!
//! Layer order, outermost first: authentication, security context gate,
//! audit interceptor, handler.

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use tackroom_auth::{Hs256JwtValidator, JwtValidator};
use tackroom_infra::audit::AuditSink;
use tackroom_infra::config::{ContextFailurePolicy, SecurityConfig};
use tackroom_infra::context_store::ContextStore;
use tackroom_infra::security::SecurityContextManager;

use crate::{audit, gate, middleware};

pub mod errors;
pub mod routes;

/// Everything the router needs, built once at start-up.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ContextStore>,
    pub manager: Arc<SecurityContextManager>,
    pub jwt: Arc<dyn JwtValidator>,
    pub audit: Arc<dyn AuditSink>,
    pub on_context_failure: ContextFailurePolicy,
    pub skip_routes: Arc<[String]>,
}

impl AppState {
    pub fn new(config: &SecurityConfig, store: Arc<dyn ContextStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            manager: Arc::new(SecurityContextManager::from_config(config)),
            jwt: Arc::new(Hs256JwtValidator::new(config.jwt_secret.clone().into_bytes())),
            audit,
            on_context_failure: config.on_context_failure,
            skip_routes: config.skip_routes.iter().cloned().collect(),
        }
    }

    pub fn gate_state(&self) -> gate::GateState {
        gate::GateState::new(self.store.clone(), self.manager.clone(), self.on_context_failure)
            .with_skip_routes(self.skip_routes.iter().cloned())
    }

    pub fn auth_state(&self) -> middleware::AuthState {
        middleware::AuthState { jwt: self.jwt.clone() }
    }

    pub fn audit_state(&self) -> audit::AuditState {
        audit::AuditState {
            sink: self.audit.clone(),
        }
    }
}

/// Wrap `routes` in the request pipeline: authentication, security context
/// gate, audit interceptor.
pub fn with_request_pipeline(routes: Router, state: &AppState) -> Router {
    routes
        .layer(Extension(state.manager.clone()))
        .layer(axum::middleware::from_fn_with_state(
            state.audit_state(),
            audit::audit_interceptor,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.gate_state(),
            gate::request_context_gate,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.auth_state(),
            middleware::auth_middleware,
        ))
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    with_request_pipeline(routes::router(), &state).layer(ServiceBuilder::new())
}
