use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::variables::{ProtectedTable, ScopeColumn, SessionVariable};

/// Owned, `Send` future borrowing from `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identity of one physical database connection (backend pid for Postgres).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Context store operation error.
///
/// Reads and writes name the offending variable. Releasing the connection
/// stays the caller's job (see [`with_connection`]).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextStoreError {
    #[error("failed to acquire a database connection: {0}")]
    Acquire(String),

    #[error("failed to set session variable '{variable}': {message}")]
    Write {
        variable: SessionVariable,
        message: String,
    },

    #[error("failed to read session variable '{variable}': {message}")]
    Read {
        variable: SessionVariable,
        message: String,
    },

    #[error("session variable transaction failed: {0}")]
    Transaction(String),

    #[error("catalog query on '{target}' failed: {message}")]
    Catalog { target: String, message: String },
}

impl ContextStoreError {
    /// The session variable involved, if any.
    pub fn variable(&self) -> Option<SessionVariable> {
        match self {
            ContextStoreError::Write { variable, .. } | ContextStoreError::Read { variable, .. } => {
                Some(*variable)
            }
            _ => None,
        }
    }
}

/// One physical connection's session-scoped variables.
///
/// Every method runs on *this* connection; nothing here goes through a pool.
#[async_trait]
pub trait SessionConnection: Send {
    fn connection_id(&self) -> ConnectionId;

    /// `set_config(name, value, false)` with both arguments bound.
    async fn set_variable(&mut self, variable: SessionVariable, value: &str) -> Result<(), ContextStoreError>;

    /// Write all values or none of them.
    async fn set_variables(&mut self, values: &[(SessionVariable, String)]) -> Result<(), ContextStoreError>;

    /// Current value, `None` when the variable was never set on this session.
    async fn get_variable(&mut self, variable: SessionVariable) -> Result<Option<String>, ContextStoreError>;

    async fn get_variables(
        &mut self,
        variables: &[SessionVariable],
    ) -> Result<Vec<(SessionVariable, Option<String>)>, ContextStoreError> {
        let mut out = Vec::with_capacity(variables.len());
        for variable in variables {
            out.push((*variable, self.get_variable(*variable).await?));
        }
        Ok(out)
    }

    /// Close this connection on release instead of returning it to the pool.
    fn poison(&mut self);
}

/// RLS state of one protected table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablePolicy {
    pub table: ProtectedTable,
    pub exists: bool,
    pub rls_enabled: bool,
    pub rls_forced: bool,
    pub policies: Vec<String>,
}

impl TablePolicy {
    pub fn missing(table: ProtectedTable) -> Self {
        Self {
            table,
            exists: false,
            rls_enabled: false,
            rls_forced: false,
            policies: Vec::new(),
        }
    }
}

/// Read-only policy introspection, evaluated on the same connection (and so
/// under the same session context) as the request's business queries.
#[async_trait]
pub trait PolicyCatalog: Send {
    async fn table_policy(&mut self, table: ProtectedTable) -> Result<TablePolicy, ContextStoreError>;

    /// Rows of `table` visible right now whose `column` differs from `value`
    /// (NULL counts as different).
    async fn count_rows_outside(
        &mut self,
        table: ProtectedTable,
        column: ScopeColumn,
        value: &str,
    ) -> Result<i64, ContextStoreError>;

    /// Whether the login role ignores RLS (superuser or BYPASSRLS).
    async fn login_role_bypasses_rls(&mut self) -> Result<bool, ContextStoreError>;
}

/// A connection usable for both context propagation and introspection.
pub trait DatabaseSession: SessionConnection + PolicyCatalog {}

impl<T: SessionConnection + PolicyCatalog + ?Sized> DatabaseSession for T {}

/// Type-erased session as handed out by a [`ContextStore`].
pub type DynSession = dyn DatabaseSession;

/// Checked-out session; releasing it goes through [`ContextStore::release`].
pub type PooledSession = Box<DynSession>;

/// Hands out dedicated connections and takes them back.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn acquire(&self) -> Result<PooledSession, ContextStoreError>;

    /// Reset every variable to its default and give the connection back.
    /// A connection that cannot be reset is poisoned rather than reused.
    async fn release(&self, mut session: PooledSession) {
        let connection_id = session.connection_id();
        if let Err(e) = session.set_variables(&SessionVariable::defaults()).await {
            tracing::error!(
                %connection_id,
                error = %e,
                "failed to reset session variables on release; discarding connection"
            );
            session.poison();
        }
        drop(session);
    }
}

/// Run `f` on a dedicated connection and release it on every exit path.
///
/// If the returned future is dropped midway, the connection is still reset by
/// the store's drop/after-release hook before anyone else can check it out.
pub async fn with_connection<S, F, T, E>(store: &S, f: F) -> Result<T, E>
where
    S: ContextStore + ?Sized,
    F: for<'c> FnOnce(&'c mut DynSession) -> BoxFuture<'c, Result<T, E>>,
    E: From<ContextStoreError>,
{
    let mut session = store.acquire().await?;
    let result = f(session.as_mut()).await;
    store.release(session).await;
    result
}
