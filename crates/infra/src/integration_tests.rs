//! Integration tests across the context store, manager and compliance checks.
//!
//! Tests: Principal → SecurityContextManager → ContextStore → release/reuse
//!
//! Verifies:
//! - Contexts never leak between connections or into the next checkout
//! - Privilege violations leave the active context unchanged
//! - Scoped checkouts release the connection on every exit path

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tackroom_auth::{Principal, Role};
    use tackroom_core::{FactoryId, FitterId, PrincipalId, TenantId};

    use crate::context_store::{
        ContextStore, ContextStoreError, InMemoryContextStore, ProtectedTable, ScopeColumn, ScopedRow, SessionVariable,
        with_connection,
    };
    use crate::security::{ContextSnapshot, SecurityContextManager, SecurityError};

    fn principal(id: &str, role: Role) -> Principal {
        Principal::new(PrincipalId::new(id).unwrap(), role)
    }

    fn factory(id: &str, factory_id: &str) -> Principal {
        principal(id, Role::Factory).with_factory(FactoryId::new(factory_id).unwrap())
    }

    fn fitter(id: &str, fitter_id: &str) -> Principal {
        principal(id, Role::Fitter).with_fitter(FitterId::new(fitter_id).unwrap())
    }

    fn orders_store() -> InMemoryContextStore {
        let store = InMemoryContextStore::new();
        store.insert_row(ProtectedTable::Orders, ScopedRow::tenant("t1").with_factory("f1").with_fitter("fit-1"));
        store.insert_row(ProtectedTable::Orders, ScopedRow::tenant("t1").with_factory("f2").with_fitter("fit-2"));
        store.insert_row(ProtectedTable::Orders, ScopedRow::tenant("t2").with_factory("f3"));
        store
    }

    #[tokio::test]
    async fn factory_scenario_end_to_end() {
        let store = orders_store();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        manager.apply_context(&factory("u1", "f1"), conn.as_mut()).await.unwrap();

        // "orders where factory_id != f1" under the applied context.
        let foreign = conn
            .count_rows_outside(ProtectedTable::Orders, ScopeColumn::FactoryId, "f1")
            .await
            .unwrap();
        assert_eq!(foreign, 0);

        let report = manager
            .validate_factory_order_access(&FactoryId::new("f1").unwrap(), conn.as_mut())
            .await;
        assert!(report.violations.is_empty(), "{report:?}");

        store.release(conn).await;
    }

    #[tokio::test]
    async fn user_bypass_attempt_is_rejected_and_changes_nothing() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let user = principal("u2", Role::User);
        manager.apply_context(&user, conn.as_mut()).await.unwrap();
        let before = manager.current_context(conn.as_mut()).await.unwrap();

        let err = manager.set_admin_bypass_context(&user, conn.as_mut()).await.unwrap_err();
        assert!(err.is_privilege_violation());

        let after = manager.current_context(conn.as_mut()).await.unwrap();
        assert_eq!(before, after);
        assert!(!after.bypass_mode);
        assert_eq!(after.user_role, Role::User.code());
    }

    #[tokio::test]
    async fn clear_then_current_reports_defaults() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        manager.apply_context(&fitter("u3", "fit-7"), conn.as_mut()).await.unwrap();
        manager.clear_user_context(conn.as_mut()).await.unwrap();

        let current = manager.current_context(conn.as_mut()).await.unwrap();
        assert_eq!(current.user_id, "");
        assert_eq!(current.user_role, 2);
        assert_eq!(current.factory_id, None);
        assert_eq!(current.fitter_id, None);
        assert!(!current.bypass_mode);
    }

    #[tokio::test]
    async fn factory_to_fitter_switch_leaves_no_factory_scope() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        manager.apply_context(&factory("u1", "f1"), conn.as_mut()).await.unwrap();
        manager.apply_context(&fitter("u1", "fit-1"), conn.as_mut()).await.unwrap();

        let raw = conn.get_variable(SessionVariable::FactoryId).await.unwrap();
        assert_eq!(raw.as_deref(), Some(""));
        let snapshot = manager.read_context(conn.as_mut()).await.unwrap();
        assert_eq!(snapshot.factory_id, None);
        assert_eq!(snapshot.fitter_id.as_deref(), Some("fit-1"));
    }

    #[tokio::test]
    async fn concurrent_requests_keep_their_own_contexts() {
        let store = Arc::new(orders_store());
        let manager = Arc::new(SecurityContextManager::default());

        let run = |p: Principal| {
            let store = store.clone();
            let manager = manager.clone();
            async move {
                let mut conn = store.acquire().await.unwrap();
                manager.apply_context(&p, conn.as_mut()).await.unwrap();
                tokio::task::yield_now().await;
                let snapshot = manager.read_context(conn.as_mut()).await.unwrap();
                store.release(conn).await;
                snapshot
            }
        };

        let (a, b) = tokio::join!(run(factory("a", "f1")), run(factory("b", "f2")));
        assert_eq!((a.user_id.as_str(), a.factory_id.as_deref()), ("a", Some("f1")));
        assert_eq!((b.user_id.as_str(), b.factory_id.as_deref()), ("b", Some("f2")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let manager = manager.clone();
                tokio::spawn(async move {
                    let id = format!("user-{i}");
                    let mut conn = store.acquire().await.unwrap();
                    manager.apply_context(&principal(&id, Role::User), conn.as_mut()).await.unwrap();
                    tokio::task::yield_now().await;
                    let seen = manager.read_context(conn.as_mut()).await.unwrap().user_id;
                    store.release(conn).await;
                    (id, seen)
                })
            })
            .collect();

        for handle in handles {
            let (expected, seen) = handle.await.unwrap();
            assert_eq!(expected, seen);
        }
        assert_eq!(store.checked_out(), 0);
    }

    #[tokio::test]
    async fn released_connection_carries_nothing_into_the_next_checkout() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();

        let mut first = store.acquire().await.unwrap();
        let id = first.connection_id();
        manager
            .set_admin_bypass_context(&principal("boss", Role::Supervisor), first.as_mut())
            .await
            .unwrap();
        store.release(first).await;

        let mut second = store.acquire().await.unwrap();
        assert_eq!(second.connection_id(), id);
        assert_eq!(manager.read_context(second.as_mut()).await.unwrap(), ContextSnapshot::cleared());
    }

    #[tokio::test]
    async fn dropped_checkout_is_reset_like_a_release() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();

        let mut conn = store.acquire().await.unwrap();
        manager.apply_context(&factory("u1", "f1"), conn.as_mut()).await.unwrap();
        // A cancelled request drops its connection without releasing it.
        drop(conn);

        let mut next = store.acquire().await.unwrap();
        assert_eq!(manager.read_context(next.as_mut()).await.unwrap(), ContextSnapshot::cleared());
    }

    #[tokio::test]
    async fn with_connection_releases_on_error() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();

        let m = manager.clone();
        let result: Result<(), SecurityError> = with_connection(&store, move |conn| {
            Box::pin(async move {
                m.apply_context(&factory("u1", "f1"), &mut *conn).await?;
                Err(SecurityError::scope_mismatch("handler failed"))
            })
        })
        .await;

        assert_eq!(result, Err(SecurityError::scope_mismatch("handler failed")));
        assert_eq!(store.checked_out(), 0);
        assert_eq!(store.idle(), 1);

        let mut conn = store.acquire().await.unwrap();
        assert_eq!(manager.read_context(conn.as_mut()).await.unwrap(), ContextSnapshot::cleared());
    }

    #[tokio::test]
    async fn unreachable_database_surfaces_as_acquire_error() {
        let store = InMemoryContextStore::new();
        store.set_unavailable(true);

        let result: Result<(), ContextStoreError> =
            with_connection(&store, |_conn| Box::pin(async move { Ok(()) })).await;
        assert!(matches!(result, Err(ContextStoreError::Acquire(_))));
    }

    #[tokio::test]
    async fn failed_reset_on_release_discards_the_connection() {
        let store = InMemoryContextStore::new();
        let manager = SecurityContextManager::default();

        let mut conn = store.acquire().await.unwrap();
        let id = conn.connection_id();
        manager.apply_context(&factory("u1", "f1"), conn.as_mut()).await.unwrap();

        store.fail_writes_to(SessionVariable::FactoryId);
        store.release(conn).await;
        store.clear_failures();

        assert_eq!(store.idle(), 0);
        assert!(store.session_variables(id).is_none());
    }

    #[tokio::test]
    async fn tenant_scoped_user_sees_only_own_tenant() {
        let store = orders_store();
        let manager = SecurityContextManager::default();
        let mut conn = store.acquire().await.unwrap();

        let t1 = TenantId::new("t1").unwrap();
        manager
            .set_tenant_context(&principal("u5", Role::User), &t1, conn.as_mut())
            .await
            .unwrap();
        let leakage = manager.detect_data_leakage(&t1, conn.as_mut()).await;
        assert!(!leakage.leaked, "{leakage:?}");

        // Without a context nothing is visible: default deny.
        manager.clear_context(conn.as_mut()).await.unwrap();
        let visible_foreign = conn
            .count_rows_outside(ProtectedTable::Orders, ScopeColumn::TenantId, "nobody")
            .await
            .unwrap();
        assert_eq!(visible_foreign, 0);
    }
}
