//! In-memory context store.
//!
//! Intended for tests/dev. It models what matters for context propagation:
//!
//! - each session has its own variables, and sessions are reused after
//!   release like pooled connections;
//! - dropping a session resets its variables (the same job the Postgres
//!   pool's `after_release` hook does);
//! - protected tables hold scoped rows, filtered by a default-deny stand-in
//!   for the real RLS policies so compliance checks have something to find;
//! - failures can be injected per variable, per table, or for the whole store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use tackroom_auth::Role;

use super::r#trait::{
    ConnectionId, ContextStore, ContextStoreError, PolicyCatalog, PooledSession, SessionConnection,
    TablePolicy,
};
use super::variables::{ProtectedTable, ScopeColumn, SessionVariable};

/// A row in a simulated protected table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopedRow {
    pub tenant_id: Option<String>,
    pub factory_id: Option<String>,
    pub fitter_id: Option<String>,
    pub owner_id: Option<String>,
}

impl ScopedRow {
    pub fn tenant(tenant_id: &str) -> Self {
        Self {
            tenant_id: Some(tenant_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_factory(mut self, factory_id: &str) -> Self {
        self.factory_id = Some(factory_id.to_string());
        self
    }

    pub fn with_fitter(mut self, fitter_id: &str) -> Self {
        self.fitter_id = Some(fitter_id.to_string());
        self
    }

    pub fn with_owner(mut self, owner_id: &str) -> Self {
        self.owner_id = Some(owner_id.to_string());
        self
    }

    fn column(&self, column: ScopeColumn) -> Option<&str> {
        match column {
            ScopeColumn::TenantId => self.tenant_id.as_deref(),
            ScopeColumn::FactoryId => self.factory_id.as_deref(),
            ScopeColumn::FitterId => self.fitter_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
struct SimulatedTable {
    rls_enabled: bool,
    rls_forced: bool,
    policies: Vec<String>,
    rows: Vec<ScopedRow>,
}

impl SimulatedTable {
    fn protected(table: ProtectedTable) -> Self {
        Self {
            rls_enabled: true,
            rls_forced: true,
            policies: vec![format!("{}_isolation", table.table_name())],
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct FailurePlan {
    unavailable: bool,
    writes: HashSet<SessionVariable>,
    reads: HashSet<SessionVariable>,
    catalog: HashSet<ProtectedTable>,
}

#[derive(Debug)]
struct Inner {
    next_id: AtomicU64,
    idle: Mutex<Vec<ConnectionId>>,
    sessions: Mutex<HashMap<ConnectionId, HashMap<SessionVariable, String>>>,
    tables: Mutex<HashMap<ProtectedTable, SimulatedTable>>,
    failures: Mutex<FailurePlan>,
    login_bypasses_rls: AtomicBool,
    checked_out: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`ContextStore`] with simulated sessions and RLS.
#[derive(Debug, Clone)]
pub struct InMemoryContextStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContextStore {
    /// Every protected table exists, has RLS enabled and forced, one policy, no rows.
    pub fn new() -> Self {
        let tables = ProtectedTable::ALL
            .into_iter()
            .map(|t| (t, SimulatedTable::protected(t)))
            .collect();

        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                idle: Mutex::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
                tables: Mutex::new(tables),
                failures: Mutex::new(FailurePlan::default()),
                login_bypasses_rls: AtomicBool::new(false),
                checked_out: AtomicUsize::new(0),
            }),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert_row(&self, table: ProtectedTable, row: ScopedRow) {
        lock(&self.inner.tables)
            .entry(table)
            .or_insert_with(|| SimulatedTable::protected(table))
            .rows
            .push(row);
    }

    pub fn set_table_policy(&self, table: ProtectedTable, rls_enabled: bool, rls_forced: bool, policies: Vec<String>) {
        let mut tables = lock(&self.inner.tables);
        let entry = tables
            .entry(table)
            .or_insert_with(|| SimulatedTable::protected(table));
        entry.rls_enabled = rls_enabled;
        entry.rls_forced = rls_forced;
        entry.policies = policies;
    }

    pub fn drop_table(&self, table: ProtectedTable) {
        lock(&self.inner.tables).remove(&table);
    }

    pub fn set_login_bypasses_rls(&self, bypasses: bool) {
        self.inner.login_bypasses_rls.store(bypasses, Ordering::SeqCst);
    }

    /// Make `acquire` fail, as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.inner.failures).unavailable = unavailable;
    }

    pub fn fail_writes_to(&self, variable: SessionVariable) {
        lock(&self.inner.failures).writes.insert(variable);
    }

    pub fn fail_reads_of(&self, variable: SessionVariable) {
        lock(&self.inner.failures).reads.insert(variable);
    }

    pub fn fail_catalog_for(&self, table: ProtectedTable) {
        lock(&self.inner.failures).catalog.insert(table);
    }

    pub fn clear_failures(&self) {
        *lock(&self.inner.failures) = FailurePlan::default();
    }

    /// Sessions currently checked out.
    pub fn checked_out(&self) -> usize {
        self.inner.checked_out.load(Ordering::SeqCst)
    }

    /// Sessions waiting in the pool.
    pub fn idle(&self) -> usize {
        lock(&self.inner.idle).len()
    }

    /// Raw variables of a session, as the database would see them.
    pub fn session_variables(&self, id: ConnectionId) -> Option<HashMap<SessionVariable, String>> {
        lock(&self.inner.sessions).get(&id).cloned()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn acquire(&self) -> Result<PooledSession, ContextStoreError> {
        if lock(&self.inner.failures).unavailable {
            return Err(ContextStoreError::Acquire("database unavailable".to_string()));
        }

        let reused = lock(&self.inner.idle).pop();
        let id = match reused {
            Some(id) => id,
            None => {
                let id = ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
                lock(&self.inner.sessions).insert(id, default_variables());
                id
            }
        };

        self.inner.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemorySession {
            id,
            inner: self.inner.clone(),
            poisoned: false,
        }))
    }
}

fn default_variables() -> HashMap<SessionVariable, String> {
    SessionVariable::defaults().into_iter().collect()
}

/// A checked-out in-memory session.
#[derive(Debug)]
pub struct InMemorySession {
    id: ConnectionId,
    inner: Arc<Inner>,
    poisoned: bool,
}

impl InMemorySession {
    fn var(&self, variable: SessionVariable) -> String {
        lock(&self.inner.sessions)
            .get(&self.id)
            .and_then(|vars| vars.get(&variable).cloned())
            .unwrap_or_default()
    }

    fn catalog_guard(&self, table: ProtectedTable) -> Result<(), ContextStoreError> {
        if lock(&self.inner.failures).catalog.contains(&table) {
            return Err(ContextStoreError::Catalog {
                target: table.table_name().to_string(),
                message: "injected catalog failure".to_string(),
            });
        }
        Ok(())
    }

    /// Default-deny stand-in for the database's RLS policies.
    fn visible(&self, table: ProtectedTable, rls_enabled: bool, row: &ScopedRow) -> bool {
        if !rls_enabled || self.inner.login_bypasses_rls.load(Ordering::SeqCst) {
            return true;
        }

        let role = self
            .var(SessionVariable::UserRole)
            .parse::<i16>()
            .ok()
            .and_then(Role::from_code)
            .unwrap_or(Role::DEFAULT);

        if role == Role::Supervisor && self.var(SessionVariable::BypassRls) == "true" {
            return true;
        }

        let matches = |column: ScopeColumn, variable: SessionVariable| {
            let current = self.var(variable);
            !current.is_empty() && row.column(column) == Some(current.as_str())
        };

        match role {
            Role::Admin | Role::Supervisor => {
                self.var(SessionVariable::TenantId).is_empty()
                    || matches(ScopeColumn::TenantId, SessionVariable::TenantId)
            }
            Role::Factory if table.has_scope_column(ScopeColumn::FactoryId) => {
                matches(ScopeColumn::FactoryId, SessionVariable::FactoryId)
            }
            Role::Fitter if table.has_scope_column(ScopeColumn::FitterId) => {
                matches(ScopeColumn::FitterId, SessionVariable::FitterId)
            }
            _ => {
                let user = self.var(SessionVariable::UserId);
                matches(ScopeColumn::TenantId, SessionVariable::TenantId)
                    || (!user.is_empty() && row.owner_id.as_deref() == Some(user.as_str()))
            }
        }
    }
}

#[async_trait]
impl SessionConnection for InMemorySession {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn set_variable(&mut self, variable: SessionVariable, value: &str) -> Result<(), ContextStoreError> {
        self.set_variables(&[(variable, value.to_string())]).await
    }

    async fn set_variables(&mut self, values: &[(SessionVariable, String)]) -> Result<(), ContextStoreError> {
        {
            let failures = lock(&self.inner.failures);
            if let Some((variable, _)) = values.iter().find(|(v, _)| failures.writes.contains(v)) {
                return Err(ContextStoreError::Write {
                    variable: *variable,
                    message: "injected write failure".to_string(),
                });
            }
        }

        let mut sessions = lock(&self.inner.sessions);
        let vars = sessions.entry(self.id).or_insert_with(default_variables);
        for (variable, value) in values {
            vars.insert(*variable, value.clone());
        }
        Ok(())
    }

    async fn get_variable(&mut self, variable: SessionVariable) -> Result<Option<String>, ContextStoreError> {
        if lock(&self.inner.failures).reads.contains(&variable) {
            return Err(ContextStoreError::Read {
                variable,
                message: "injected read failure".to_string(),
            });
        }
        Ok(lock(&self.inner.sessions)
            .get(&self.id)
            .and_then(|vars| vars.get(&variable).cloned()))
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }
}

#[async_trait]
impl PolicyCatalog for InMemorySession {
    async fn table_policy(&mut self, table: ProtectedTable) -> Result<TablePolicy, ContextStoreError> {
        self.catalog_guard(table)?;
        Ok(match lock(&self.inner.tables).get(&table) {
            Some(t) => TablePolicy {
                table,
                exists: true,
                rls_enabled: t.rls_enabled,
                rls_forced: t.rls_forced,
                policies: t.policies.clone(),
            },
            None => TablePolicy::missing(table),
        })
    }

    async fn count_rows_outside(
        &mut self,
        table: ProtectedTable,
        column: ScopeColumn,
        value: &str,
    ) -> Result<i64, ContextStoreError> {
        self.catalog_guard(table)?;
        if !table.has_scope_column(column) {
            return Err(ContextStoreError::Catalog {
                target: table.table_name().to_string(),
                message: format!("table has no '{}' column", column.column_name()),
            });
        }

        let Some(simulated) = lock(&self.inner.tables).get(&table).cloned() else {
            return Err(ContextStoreError::Catalog {
                target: table.table_name().to_string(),
                message: "relation does not exist".to_string(),
            });
        };

        let count = simulated
            .rows
            .iter()
            .filter(|row| self.visible(table, simulated.rls_enabled, row))
            .filter(|row| row.column(column) != Some(value))
            .count();
        Ok(count as i64)
    }

    async fn login_role_bypasses_rls(&mut self) -> Result<bool, ContextStoreError> {
        Ok(self.inner.login_bypasses_rls.load(Ordering::SeqCst))
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.inner.checked_out.fetch_sub(1, Ordering::SeqCst);

        if self.poisoned {
            lock(&self.inner.sessions).remove(&self.id);
            return;
        }

        // Same reset the Postgres pool runs in `after_release`.
        lock(&self.inner.sessions).insert(self.id, default_variables());
        lock(&self.inner.idle).push(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_keep_their_own_variables() {
        let store = InMemoryContextStore::new();
        let mut a = store.acquire().await.unwrap();
        let mut b = store.acquire().await.unwrap();
        assert_ne!(a.connection_id(), b.connection_id());

        a.set_variable(SessionVariable::UserId, "alice").await.unwrap();
        b.set_variable(SessionVariable::UserId, "bob").await.unwrap();

        assert_eq!(a.get_variable(SessionVariable::UserId).await.unwrap().as_deref(), Some("alice"));
        assert_eq!(b.get_variable(SessionVariable::UserId).await.unwrap().as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn dropped_session_is_reset_and_reused() {
        let store = InMemoryContextStore::new();
        let mut s = store.acquire().await.unwrap();
        let id = s.connection_id();
        s.set_variable(SessionVariable::BypassRls, "true").await.unwrap();
        drop(s);

        assert_eq!(store.checked_out(), 0);
        assert_eq!(store.idle(), 1);

        let mut again = store.acquire().await.unwrap();
        assert_eq!(again.connection_id(), id);
        assert_eq!(
            again.get_variable(SessionVariable::BypassRls).await.unwrap().as_deref(),
            Some("false")
        );
    }

    #[tokio::test]
    async fn failed_batch_write_changes_nothing() {
        let store = InMemoryContextStore::new();
        let mut s = store.acquire().await.unwrap();
        s.set_variable(SessionVariable::UserId, "before").await.unwrap();

        store.fail_writes_to(SessionVariable::FitterId);
        let err = s
            .set_variables(&[
                (SessionVariable::UserId, "after".to_string()),
                (SessionVariable::FitterId, "fit-1".to_string()),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.variable(), Some(SessionVariable::FitterId));
        assert_eq!(s.get_variable(SessionVariable::UserId).await.unwrap().as_deref(), Some("before"));
    }

    #[tokio::test]
    async fn poisoned_session_is_not_reused() {
        let store = InMemoryContextStore::new();
        let mut s = store.acquire().await.unwrap();
        let id = s.connection_id();
        s.poison();
        drop(s);

        assert_eq!(store.idle(), 0);
        assert!(store.session_variables(id).is_none());
        let fresh = store.acquire().await.unwrap();
        assert_ne!(fresh.connection_id(), id);
    }

    #[tokio::test]
    async fn unavailable_store_fails_acquire() {
        let store = InMemoryContextStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.acquire().await, Err(ContextStoreError::Acquire(_))));
    }

    #[tokio::test]
    async fn default_context_sees_no_scoped_rows() {
        let store = InMemoryContextStore::new();
        store.insert_row(ProtectedTable::Orders, ScopedRow::tenant("t1").with_factory("f1"));
        store.insert_row(ProtectedTable::Orders, ScopedRow::tenant("t2").with_factory("f2"));

        let mut s = store.acquire().await.unwrap();
        let outside = s
            .count_rows_outside(ProtectedTable::Orders, ScopeColumn::TenantId, "t1")
            .await
            .unwrap();
        assert_eq!(outside, 0);
    }

    #[tokio::test]
    async fn disabled_rls_exposes_everything() {
        let store = InMemoryContextStore::new();
        store.set_table_policy(ProtectedTable::Saddles, false, false, vec![]);
        store.insert_row(ProtectedTable::Saddles, ScopedRow::tenant("t2"));

        let mut s = store.acquire().await.unwrap();
        let outside = s
            .count_rows_outside(ProtectedTable::Saddles, ScopeColumn::TenantId, "t1")
            .await
            .unwrap();
        assert_eq!(outside, 1);
    }

    #[tokio::test]
    async fn unknown_scope_column_is_a_catalog_error() {
        let store = InMemoryContextStore::new();
        let mut s = store.acquire().await.unwrap();
        let err = s
            .count_rows_outside(ProtectedTable::Users, ScopeColumn::FactoryId, "f1")
            .await
            .unwrap_err();
        assert!(matches!(err, ContextStoreError::Catalog { .. }));
    }
}
