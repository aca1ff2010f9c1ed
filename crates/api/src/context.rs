//! Per-request extensions shared between middleware and handlers.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use tackroom_infra::context_store::{ConnectionId, PooledSession};

/// The connection pinned to this request, with the principal's security
/// context already applied.
///
/// Every business query of the request must run through it. The handle is
/// owned by the request: cloning it into anything that outlives the request
/// is a connection discipline violation and gets the connection discarded.
#[derive(Clone)]
pub struct RequestConnection {
    session: Arc<Mutex<PooledSession>>,
    connection_id: ConnectionId,
}

impl RequestConnection {
    pub(crate) fn new(session: PooledSession) -> Self {
        let connection_id = session.connection_id();
        Self {
            session: Arc::new(Mutex::new(session)),
            connection_id,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Exclusive access for one query or a group of queries.
    pub async fn lock(&self) -> MutexGuard<'_, PooledSession> {
        self.session.lock().await
    }

    /// Take the session back once the request is done.
    ///
    /// Fails, returning the shared handle, if a clone is still alive.
    pub(crate) fn into_session(self) -> Result<PooledSession, Arc<Mutex<PooledSession>>> {
        Arc::try_unwrap(self.session).map(Mutex::into_inner)
    }
}

impl std::fmt::Debug for RequestConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestConnection")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// Marks a request that must run without a security context.
///
/// The gate only sees it when it is inserted outside the request pipeline,
/// e.g. `with_request_pipeline(routes, &state).layer(Extension(SkipSecurityContext))`
/// or a middleware wrapping the whole router. A route-level layer runs after
/// the gate and has no effect; list such routes in `skip_routes` instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipSecurityContext;
