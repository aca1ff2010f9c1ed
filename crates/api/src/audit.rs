//! Audit interceptor.
//!
//! Successful mutating requests by an authenticated principal produce one
//! [`AuditEntry`]. Recording is spawned off the request path; a failing
//! sink is logged and never changes the response.

use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use tackroom_auth::Principal;
use tackroom_infra::audit::{AuditEntry, AuditSink, AuditVerb, StatusTransition, infer_entity};

#[derive(Clone)]
pub struct AuditState {
    pub sink: Arc<dyn AuditSink>,
}

/// Per-request slot for facts only the handler knows.
///
/// Inserted for every audited request; handlers that change an order's
/// status record the before/after pair here.
#[derive(Debug, Clone, Default)]
pub struct AuditCapture {
    transition: Arc<Mutex<Option<StatusTransition>>>,
}

impl AuditCapture {
    pub fn record_status_transition(&self, from: Option<String>, to: impl Into<String>) {
        let mut slot = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(StatusTransition { from, to: to.into() });
    }

    fn take(&self) -> Option<StatusTransition> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

pub async fn audit_interceptor(State(state): State<AuditState>, mut req: Request, next: Next) -> Response {
    let verb = AuditVerb::from_method(req.method().as_str());
    let principal = req.extensions().get::<Principal>().cloned();

    let (Some(verb), Some(principal)) = (verb, principal) else {
        return next.run(req).await;
    };

    let path = req.uri().path().to_string();
    let capture = AuditCapture::default();
    req.extensions_mut().insert(capture.clone());

    let response = next.run(req).await;

    if response.status().is_success() {
        let entry = AuditEntry::new(&principal, verb, infer_entity(&path), capture.take());
        let sink = state.sink.clone();
        tokio::spawn(async move {
            let entry_id = entry.entry_id;
            if let Err(e) = sink.record(entry).await {
                tracing::warn!(%entry_id, error = %e, "failed to record audit entry");
            }
        });
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_the_last_transition() {
        let capture = AuditCapture::default();
        let handler_side = capture.clone();

        handler_side.record_status_transition(Some("DRAFT".into()), "SUBMITTED");
        handler_side.record_status_transition(Some("SUBMITTED".into()), "IN_PRODUCTION");

        let t = capture.take().unwrap();
        assert_eq!(t.from.as_deref(), Some("SUBMITTED"));
        assert_eq!(t.to, "IN_PRODUCTION");
        assert!(capture.take().is_none());
    }
}
