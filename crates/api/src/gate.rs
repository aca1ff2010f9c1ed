//! Request context gate.
//!
//! Runs after authentication and before handlers. For an authenticated
//! request it pins one connection, applies the principal's security context
//! to it and hands it to the handler as a [`RequestConnection`]. When the
//! request finishes the context is cleared and the connection released.
//!
//! | Situation | Result |
//! |-----------|--------|
//! | no principal | pass through, no connection |
//! | skipped route | pass through, no connection |
//! | context applied | handler runs with `RequestConnection` |
//! | store failure, policy `proceed` | warn, handler runs without a connection |
//! | store failure, policy `reject` | `503` |
//! | privilege violation | `403`, regardless of policy |
//!
//! There is no retry: a failed application goes straight to the policy.
//!
//! Skipping is decided by matched route path (`/orders/:id`, not the raw
//! URI). The gate runs inside each route, so a [`SkipSecurityContext`]
//! marker only counts when a layer outside the pipeline inserts it.

use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use tackroom_auth::Principal;
use tackroom_infra::config::{ContextFailurePolicy, DEFAULT_SKIP_ROUTES};
use tackroom_infra::context_store::ContextStore;
use tackroom_infra::security::{ConnectionDisciplineError, SecurityContextManager, SecurityError};

use crate::app::errors::json_error;
use crate::context::{RequestConnection, SkipSecurityContext};

#[derive(Clone)]
pub struct GateState {
    pub store: Arc<dyn ContextStore>,
    pub manager: Arc<SecurityContextManager>,
    pub on_failure: ContextFailurePolicy,
    pub skip_routes: Arc<[String]>,
}

impl GateState {
    pub fn new(
        store: Arc<dyn ContextStore>,
        manager: Arc<SecurityContextManager>,
        on_failure: ContextFailurePolicy,
    ) -> Self {
        Self {
            store,
            manager,
            on_failure,
            skip_routes: DEFAULT_SKIP_ROUTES.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// Replace the skipped routes with `routes`.
    pub fn with_skip_routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_routes = routes.into_iter().map(Into::into).collect();
        self
    }

    fn skips(&self, req: &Request) -> bool {
        if req.extensions().get::<SkipSecurityContext>().is_some() {
            return true;
        }
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str)
            .unwrap_or_else(|| req.uri().path());
        self.skip_routes.iter().any(|route| route == path)
    }
}

pub async fn request_context_gate(State(gate): State<GateState>, mut req: Request, next: Next) -> Response {
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return next.run(req).await;
    };
    if gate.skips(&req) {
        return next.run(req).await;
    }

    let mut session = match gate.store.acquire().await {
        Ok(session) => session,
        Err(e) => return on_failure(&gate, &principal, SecurityError::from(e), req, next).await,
    };

    if let Err(e) = gate.manager.apply_context(&principal, session.as_mut()).await {
        gate.store.release(session).await;
        return on_failure(&gate, &principal, e, req, next).await;
    }

    let connection = RequestConnection::new(session);
    req.extensions_mut().insert(connection.clone());

    let response = next.run(req).await;

    finish(&gate, connection).await;
    response
}

async fn on_failure(
    gate: &GateState,
    principal: &Principal,
    err: SecurityError,
    req: Request,
    next: Next,
) -> Response {
    if err.is_privilege_violation() {
        tracing::warn!(principal_id = %principal.id, error = %err, "security context rejected");
        return json_error(StatusCode::FORBIDDEN, "privilege_violation", err.to_string());
    }

    match gate.on_failure {
        ContextFailurePolicy::Proceed => {
            tracing::warn!(
                principal_id = %principal.id,
                error = %err,
                "failed to apply security context; proceeding without it"
            );
            next.run(req).await
        }
        ContextFailurePolicy::Reject => {
            tracing::error!(principal_id = %principal.id, error = %err, "failed to apply security context");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "security_context_unavailable",
                "security context could not be established",
            )
        }
    }
}

async fn finish(gate: &GateState, connection: RequestConnection) {
    let connection_id = connection.connection_id();

    match connection.into_session() {
        Ok(mut session) => {
            if let Err(e) = gate.manager.clear_context(session.as_mut()).await {
                tracing::warn!(%connection_id, error = %e, "failed to clear security context");
            }
            gate.store.release(session).await;
        }
        Err(shared) => {
            let err = ConnectionDisciplineError(format!(
                "{connection_id} is still referenced after its request completed"
            ));
            tracing::error!(error = %err, "discarding connection");
            // Never wait on the holder here: it may keep the lock indefinitely.
            let poisoned = match shared.try_lock() {
                Ok(mut session) => {
                    session.poison();
                    true
                }
                Err(_) => false,
            };
            if !poisoned {
                tokio::spawn(async move {
                    shared.lock().await.poison();
                });
            }
        }
    }
}
